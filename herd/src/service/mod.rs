//! Worker service runtime.
//!
//! [`Service`] is the object-safe contract the process driver forks;
//! [`SoftIrq`] is the periodic-step main loop most workers (and the hub
//! itself) are built on.

pub mod events;
mod softirq;

pub use softirq::{SoftIrq, SoftIrqCtx, SoftIrqOptions};

use crate::watchdog::Watchdog;

/// Boxed error produced by a user step or a serving loop.
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A long-running worker body.
///
/// `serve` executes inside the forked child and only returns when the
/// service is asked to stop. The supervisor keeps the instance on its
/// side of the fork and observes liveness through [`watchdog`]
/// (whose cells are shared across the fork).
///
/// [`watchdog`]: Service::watchdog
pub trait Service: Send {
    /// Run until stopped. A clean return exits the worker with code 0;
    /// an error exits it with code 1 (observed as failed).
    fn serve(&mut self) -> Result<(), StepError>;

    /// Ask a running loop to stop after the current step.
    fn stop(&mut self);

    /// The liveness watchdog whose cells are shared with the supervisor.
    fn watchdog(&self) -> &dyn Watchdog;
}

impl<T: SoftIrq> Service for T {
    fn serve(&mut self) -> Result<(), StepError> {
        SoftIrq::serve(self)
    }

    fn stop(&mut self) {
        SoftIrq::stop(self)
    }

    fn watchdog(&self) -> &dyn Watchdog {
        self.ctx().watchdog.as_ref()
    }
}
