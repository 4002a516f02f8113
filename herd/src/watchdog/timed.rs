//! Time-based watchdog.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use herd_shm::SharedWord;

use super::{ContextFlag, Watchdog, WatchdogError};

fn unix_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Shared-timer watchdog: detects stale services through an outdated
/// heartbeat timestamp.
///
/// The heartbeat cell stores UNIX seconds and is written by the worker
/// (`generate_heartbeat`) and read by the supervisor (`is_alive`);
/// both sides address the same cell across the fork.
pub struct TimedWatchdog {
    heartbeat: SharedWord,
    context: ContextFlag,
    timeout: Duration,
    failed: bool,
}

impl TimedWatchdog {
    /// Create a watchdog with its heartbeat cell seeded to "now".
    pub fn new(heartbeat_timeout: Duration) -> Result<Self, WatchdogError> {
        Ok(Self {
            heartbeat: SharedWord::new(unix_now() as i64)?,
            context: ContextFlag::new()?,
            timeout: heartbeat_timeout,
            failed: false,
        })
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn context(&self) -> &ContextFlag {
        &self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut ContextFlag {
        &mut self.context
    }

    /// Whether a step is currently in progress in either process.
    pub(crate) fn in_context(&self) -> bool {
        self.context.is_set()
    }
}

impl Watchdog for TimedWatchdog {
    fn enter(&mut self) -> Result<(), WatchdogError> {
        self.context.set_local(true);
        let result = (|| {
            self.generate_heartbeat()?;
            self.check_health()
        })();
        if result.is_ok() {
            self.context.set_shared(true);
        }
        self.context.set_local(false);
        result
    }

    fn exit(&mut self) {
        self.context.set_shared(false);
    }

    fn generate_heartbeat(&mut self) -> Result<(), WatchdogError> {
        self.heartbeat.store(unix_now() as i64);
        tracing::debug!("heartbeat time record updated");
        Ok(())
    }

    fn check_health(&self) -> Result<(), WatchdogError> {
        if self.failed {
            return Err(WatchdogError::MarkedFailed);
        }
        let now = unix_now();
        let last_heartbeat = self.heartbeat.load();
        let delta = now - last_heartbeat as f64;
        if delta >= self.timeout.as_secs_f64() {
            return Err(WatchdogError::HeartbeatTimeout {
                timeout: self.timeout.as_secs_f64(),
                delta,
                last_heartbeat,
                now: now as i64,
            });
        }
        Ok(())
    }

    fn mark_failed(&mut self) {
        self.failed = true;
        tracing::info!("watchdog manually marked as failed");
    }
}
