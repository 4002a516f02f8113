//! Worker liveness watchdogs.
//!
//! A watchdog is the liveness token a worker refreshes on every step;
//! the supervisor reads it to tell "alive and progressing" from "alive
//! and hung". [`TimedWatchdog`] checks a fork-shared heartbeat
//! timestamp; [`LeaseWatchdog`] additionally ties liveness to a
//! renewable lock in a key-value coordination service.
//!
//! All cross-process state lives in [`herd_shm`] cells allocated at
//! construction time, before the worker is forked.

mod error;
mod lease;
mod timed;

pub use error::{Severity, WatchdogError};
pub use lease::{LeaseOptions, LeaseWatchdog};
pub use timed::TimedWatchdog;

use herd_shm::{ShmError, SharedFlag};

/// Liveness contract between a worker step loop and the supervisor.
///
/// `enter`/`exit` bracket one work step in the worker process;
/// `is_alive` is polled from the supervisor process through the cells
/// both sides share.
pub trait Watchdog: Send {
    /// Begin a step: mark the step in progress, refresh liveness and run
    /// a final health check. On failure the in-progress mark is cleared
    /// before the error is returned.
    fn enter(&mut self) -> Result<(), WatchdogError>;

    /// Finish a step: clear the in-progress mark. Never fails.
    fn exit(&mut self);

    /// Refresh the liveness token.
    fn generate_heartbeat(&mut self) -> Result<(), WatchdogError>;

    /// Run the health check.
    fn check_health(&self) -> Result<(), WatchdogError>;

    /// Whether the service looks alive. Never errors: minor failures are
    /// expected and log at info, anything else logs at error; both read
    /// as "not alive".
    fn is_alive(&self) -> bool {
        match self.check_health() {
            Ok(()) => {
                tracing::debug!("the service is alive");
                true
            }
            Err(err) if err.is_minor() => {
                tracing::info!(error = %err, "the service is not alive");
                false
            }
            Err(err) => {
                tracing::error!(error = %err, "health check failed");
                false
            }
        }
    }

    /// Manually mark the watchdog failed; subsequent health checks fail
    /// critically until the watchdog is rebuilt.
    fn mark_failed(&mut self);

    /// Release any held resources.
    fn teardown(&mut self) {}
}

/// Fully functional watchdog that performs no checks: always alive
/// unless manually marked failed. The default for services that opt out
/// of liveness monitoring.
#[derive(Debug, Default)]
pub struct NoopWatchdog {
    failed: bool,
}

impl NoopWatchdog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Watchdog for NoopWatchdog {
    fn enter(&mut self) -> Result<(), WatchdogError> {
        self.check_health()
    }

    fn exit(&mut self) {}

    fn generate_heartbeat(&mut self) -> Result<(), WatchdogError> {
        Ok(())
    }

    fn check_health(&self) -> Result<(), WatchdogError> {
        if self.failed {
            return Err(WatchdogError::MarkedFailed);
        }
        Ok(())
    }

    fn mark_failed(&mut self) {
        self.failed = true;
        tracing::info!("watchdog manually marked as failed");
    }
}

/// In-step marker combining a fork-shared flag with a process-local bit,
/// so a step in progress in the child reads as "in step" from the parent
/// while `enter` is still running.
#[derive(Debug)]
pub(crate) struct ContextFlag {
    shared: SharedFlag,
    local: bool,
}

impl ContextFlag {
    pub(crate) fn new() -> Result<Self, ShmError> {
        Ok(Self { shared: SharedFlag::new(false)?, local: false })
    }

    pub(crate) fn is_set(&self) -> bool {
        self.shared.get() || self.local
    }

    pub(crate) fn set_local(&mut self, value: bool) {
        self.local = value;
    }

    pub(crate) fn set_shared(&self, value: bool) {
        self.shared.set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_is_alive_until_marked_failed() {
        let mut wd = NoopWatchdog::new();
        assert!(wd.is_alive());
        wd.mark_failed();
        assert!(!wd.is_alive());
        assert!(matches!(wd.check_health(), Err(WatchdogError::MarkedFailed)));
    }

    #[test]
    fn context_flag_ors_local_and_shared() {
        let mut flag = ContextFlag::new().unwrap();
        assert!(!flag.is_set());
        flag.set_local(true);
        assert!(flag.is_set());
        flag.set_local(false);
        flag.set_shared(true);
        assert!(flag.is_set());
        flag.set_shared(false);
        assert!(!flag.is_set());
    }
}
