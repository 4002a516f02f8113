//! Watchdog error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// How bad a watchdog failure is.
///
/// Minor failures are transient and expected (a lock briefly held
/// elsewhere): the step is skipped but the heartbeat is still generated.
/// Critical failures withhold the heartbeat, so the next observation
/// marks the worker numb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Minor,
    Critical,
}

/// Failures raised by watchdog implementations.
#[derive(Error, Debug)]
pub enum WatchdogError {
    /// Sticky manual failure mark is set.
    #[error("service is marked as failed")]
    MarkedFailed,

    /// Heartbeat timestamp went stale.
    #[error(
        "service heartbeat timed out at {now}: {delta:.3} >= {timeout:.3} (last: {last_heartbeat})"
    )]
    HeartbeatTimeout { timeout: f64, delta: f64, last_heartbeat: i64, now: i64 },

    /// Lock could not be acquired or refreshed; transient.
    #[error("service lock acquisition failed for {key}: {reason}")]
    LockAcquire { key: String, reason: String },

    /// Lock could not be created at the network level.
    #[error("service lock creation failed for {key}: {reason}")]
    LockCreate { key: String, reason: String },

    /// No lock is held although a step is in progress.
    #[error("lock {key} is undefined within step context")]
    LockUndefined { key: String },

    /// The held lock has expired.
    #[error("lock {key} has expired")]
    LockExpired { key: String },

    /// Lock status could not be determined during a health check.
    #[error("failed to get status of lock {key}: {reason}")]
    LockStatus { key: String, reason: String },

    /// Lock refresh failed while generating a heartbeat inside a step.
    #[error("failed to refresh lock {key} on heartbeat: {reason}")]
    HeartbeatLock { key: String, reason: String },

    /// Lease-backed TTL below the safe minimum without the unsafe opt-in.
    #[error("unsafe lock TTL: {ttl:?} < {min:?}")]
    UnsafeLockTtl { ttl: Duration, min: Duration },

    /// Shared cell allocation failed at construction.
    #[error("failed to allocate watchdog cells: {0}")]
    Cells(#[from] herd_shm::ShmError),
}

impl WatchdogError {
    pub fn severity(&self) -> Severity {
        match self {
            WatchdogError::LockAcquire { .. } => Severity::Minor,
            _ => Severity::Critical,
        }
    }

    pub fn is_minor(&self) -> bool {
        self.severity() == Severity::Minor
    }
}
