//! Supervisor error types.
//!
//! Declaration errors are raised synchronously from API calls and never
//! caught by the core. [`Error::StopHub`] is the one control-flow error:
//! controllers raise it to request a clean shutdown, and the hub catches
//! it exactly at its step boundary.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::state::State;
use crate::watchdog::WatchdogError;

/// Errors produced by the hub and drivers.
#[derive(Error, Debug)]
pub enum Error {
    /// A unit with this uuid is already declared on the hub.
    #[error("unit {uuid} already exists")]
    UnitExists { uuid: Uuid },

    /// No unit with this uuid is declared on the hub.
    #[error("unit {uuid} is not found")]
    UnitNotFound { uuid: Uuid },

    /// A service with this uuid is already registered with the driver.
    #[error("service {uuid} already exists")]
    ServiceExists { uuid: Uuid },

    /// No service with this uuid is registered with the driver.
    #[error("service {uuid} is not found")]
    ServiceNotFound { uuid: Uuid },

    /// The requested state is not a valid target for this driver.
    #[error("driver does not support target state {state}")]
    DriverUnsupportedState { state: State },

    /// A transition found the process in a state it cannot proceed from.
    #[error("service {uuid} is in illegal state {state}")]
    UnexpectedServiceState { uuid: Uuid, state: State },

    /// A bounded wait elapsed before the worker exited.
    #[error("service {uuid} wait timed out after {timeout:?}")]
    ServiceWaitTimeout { uuid: Uuid, timeout: Duration },

    /// Programmer error: the transition table has no entry for this pair.
    #[error("no transition from {from} to {to}")]
    TransitionNotSupported { from: State, to: State },

    /// `update_unit` tried to change a unit's service factory.
    #[error("unit {uuid} update changes the service factory")]
    UnitMismatch { uuid: Uuid },

    /// Clean-shutdown request raised by a controller.
    #[error("stop hub by reason: {reason}")]
    StopHub { reason: String },

    /// Forking a worker process failed.
    #[error("failed to spawn worker process: {source}")]
    Spawn {
        #[from]
        source: nix::Error,
    },

    /// Shared cell allocation failed.
    #[error(transparent)]
    Shm(#[from] herd_shm::ShmError),

    /// Watchdog construction or health failure surfaced through an API call.
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
}

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;
