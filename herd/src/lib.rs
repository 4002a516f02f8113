//! # herd — multi-process service supervisor
//!
//! A cluster-of-one: herd runs a set of long-running worker services as
//! child processes on a single host, continuously drives each worker
//! toward its declared target lifecycle state, and detects liveness
//! failures through a watchdog protocol combining an intra-host
//! heartbeat with an optional distributed lease.
//!
//! ## Architecture
//!
//! - [`Hub`] — registry of declared [`Unit`]s; runs the controller on a
//!   fixed cadence and orchestrates shutdown. The hub is itself a
//!   [`SoftIrq`] service, so it follows the same loop/heartbeat
//!   discipline as any worker.
//! - [`Controller`] — reconciliation policy comparing declared targets
//!   against observed states ([`ForceTargetController`],
//!   [`PanicController`]).
//! - [`ProcessDriver`] — materializes units as forked child processes
//!   and derives observed state from exit codes and watchdog liveness.
//! - [`Watchdog`] — the liveness token a worker refreshes each step;
//!   [`TimedWatchdog`] checks a fork-shared heartbeat timestamp,
//!   [`LeaseWatchdog`] additionally holds a renewable lock in a KV
//!   coordination service (see [`coord`]).
//! - [`SoftIrq`] — the periodic-step main loop a worker runs inside its
//!   child process: signal handling, heartbeat generation, step
//!   dispatch, measured events.
//!
//! ## Usage sketch
//!
//! ```no_run
//! use std::time::Duration;
//! use herd::{Hub, ProcessDriver, ForceTargetController, SoftIrq, State};
//! use herd::service::{SoftIrqCtx, SoftIrqOptions};
//! use herd::watchdog::NoopWatchdog;
//!
//! # fn worker_factory() -> herd::ServiceFactory { unimplemented!() }
//! let ctx = SoftIrqCtx::new(
//!     SoftIrqOptions { step_period: Duration::from_secs(1), ..Default::default() },
//!     Box::new(NoopWatchdog::new()),
//! );
//! let mut hub = Hub::new(
//!     Box::new(ProcessDriver::new()),
//!     Box::new(ForceTargetController::new()),
//!     ctx,
//! );
//! hub.add_service(worker_factory(), State::Running)?;
//! hub.serve()?;
//! # Ok::<(), herd::service::StepError>(())
//! ```

pub mod config;
pub mod controller;
pub mod coord;
pub mod driver;
pub mod error;
pub mod hub;
pub mod logging;
pub mod service;
pub mod signals;
pub mod state;
pub mod unit;
pub mod watchdog;

pub use controller::{Controller, ForceTargetController, PanicController};
pub use driver::{Driver, ProcessDriver};
pub use error::{Error, Result};
pub use hub::Hub;
pub use service::{Service, SoftIrq};
pub use state::State;
pub use unit::{ServiceFactory, Unit};
pub use watchdog::{LeaseWatchdog, NoopWatchdog, TimedWatchdog, Watchdog};

#[cfg(test)]
mod test_support;
