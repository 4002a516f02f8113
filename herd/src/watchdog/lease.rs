//! Lease-backed watchdog.

use std::sync::Arc;
use std::time::Duration;

use herd_shm::SharedWord;

use crate::coord::{KvClient, KvError, LockHandle};

use super::timed::TimedWatchdog;
use super::{Watchdog, WatchdogError};

/// Optional construction parameters for a [`LeaseWatchdog`].
#[derive(Default)]
pub struct LeaseOptions {
    /// Label attached to the lock; defaults to the short hostname.
    pub label: Option<String>,
    /// Lock TTL; defaults to the safe minimum.
    pub ttl: Option<Duration>,
    /// Allow a TTL below the safe minimum.
    pub unsafe_ttl: bool,
}

/// Watchdog tying service liveness to a renewable lock in a KV
/// coordination service, on top of the shared-timer heartbeat.
///
/// The lock handle lives only in the process that acquired it; the lease
/// id is mirrored into fork-shared cells, so the peer process can
/// reconstruct the lock for its own health checks. A lease-backed
/// watchdog used inside a measured step must hold a lease: losing it
/// mid-step is a critical failure.
pub struct LeaseWatchdog {
    timer: TimedWatchdog,
    client: Arc<dyn KvClient>,
    lock: Option<LockHandle>,
    lease_defined: SharedWord,
    lease_id: SharedWord,
    lock_key: String,
    lock_label: String,
    lock_ttl: Duration,
}

impl std::fmt::Debug for LeaseWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseWatchdog")
            .field("lock_key", &self.lock_key)
            .field("lock_label", &self.lock_label)
            .field("lock_ttl", &self.lock_ttl)
            .finish_non_exhaustive()
    }
}

fn short_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .and_then(|name| name.split('.').next().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string())
}

impl LeaseWatchdog {
    /// Safe TTL floor: three missed refresh rounds of
    /// `1 + heartbeat_timeout + kv_timeout` seconds each.
    pub fn min_ttl(heartbeat_timeout: Duration, kv_timeout: Duration) -> Duration {
        (Duration::from_secs(1) + heartbeat_timeout + kv_timeout) * 3
    }

    pub fn new(
        heartbeat_timeout: Duration,
        client: Arc<dyn KvClient>,
        lock_key: impl Into<String>,
        options: LeaseOptions,
    ) -> Result<Self, WatchdogError> {
        let min = Self::min_ttl(heartbeat_timeout, client.timeout());
        let ttl = options.ttl.unwrap_or(min);
        if !options.unsafe_ttl && ttl < min {
            return Err(WatchdogError::UnsafeLockTtl { ttl, min });
        }
        Ok(Self {
            timer: TimedWatchdog::new(heartbeat_timeout)?,
            client,
            lock: None,
            lease_defined: SharedWord::new(0)?,
            lease_id: SharedWord::new(0)?,
            lock_key: lock_key.into(),
            lock_label: options.label.unwrap_or_else(short_hostname),
            lock_ttl: ttl,
        })
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    fn set_lock(&mut self, lock: Option<LockHandle>) {
        self.lease_defined.store(lock.is_some() as i64);
        self.lease_id.store(lock.as_ref().map_or(0, |lock| lock.id));
        self.lock = lock;
    }

    fn shared_lease_id(&self) -> Result<i64, WatchdogError> {
        if self.lease_defined.load() != 0 {
            Ok(self.lease_id.load())
        } else {
            Err(WatchdogError::LockUndefined { key: self.lock_key.clone() })
        }
    }

    /// Refresh the held lock. An expired lock is dropped before the
    /// error is returned, so the caller can fall through to acquire.
    fn refresh_lock(&mut self) -> Result<(), KvError> {
        let Some(lock) = &self.lock else {
            return Ok(());
        };
        let (key, id) = (lock.key.clone(), lock.id);
        tracing::debug!(key = %key, id, "refreshing lock");
        match self.client.refresh(lock) {
            Ok(()) => {
                tracing::debug!(key = %key, id, "refreshed lock");
                Ok(())
            }
            Err(KvError::LockExpired) => {
                tracing::info!(key = %key, id, "lock has expired");
                self.set_lock(None);
                Err(KvError::LockExpired)
            }
            Err(err) => Err(err),
        }
    }

    fn lock_phase(&mut self) -> Result<(), WatchdogError> {
        if self.lock.is_some() {
            match self.refresh_lock() {
                Ok(()) => return Ok(()),
                // expired: fall through to a fresh acquire
                Err(KvError::LockExpired) => {}
                Err(err) => {
                    return Err(WatchdogError::LockAcquire {
                        key: self.lock_key.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        match self.client.acquire(&self.lock_key, self.lock_ttl, &self.lock_label) {
            Ok(lock) => {
                tracing::info!(
                    key = %lock.key,
                    id = lock.id,
                    ttl_s = self.lock_ttl.as_secs_f64(),
                    label = %self.lock_label,
                    "acquired lock"
                );
                self.set_lock(Some(lock));
                Ok(())
            }
            Err(err) => {
                tracing::debug!(key = %self.lock_key, label = %self.lock_label, error = %err, "failed to acquire lock");
                Err(match err {
                    KvError::LockCreate { reason } => {
                        WatchdogError::LockCreate { key: self.lock_key.clone(), reason }
                    }
                    other => WatchdogError::LockAcquire {
                        key: self.lock_key.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    fn status_error(&self, err: KvError) -> WatchdogError {
        match err {
            KvError::LeaseExpired { .. } | KvError::LockExpired => {
                WatchdogError::LockExpired { key: self.lock_key.clone() }
            }
            other => WatchdogError::LockStatus {
                key: self.lock_key.clone(),
                reason: other.to_string(),
            },
        }
    }
}

impl Watchdog for LeaseWatchdog {
    fn enter(&mut self) -> Result<(), WatchdogError> {
        self.timer.context_mut().set_local(true);
        let result = (|| {
            self.lock_phase()?;
            self.generate_heartbeat()?;
            self.check_health()
        })();
        if result.is_ok() {
            self.timer.context().set_shared(true);
        }
        self.timer.context_mut().set_local(false);
        result
    }

    fn exit(&mut self) {
        self.timer.exit();
    }

    /// Update the timer, then refresh the lock if one is held. A refresh
    /// failure inside a step is critical; outside it is logged only.
    fn generate_heartbeat(&mut self) -> Result<(), WatchdogError> {
        self.timer.generate_heartbeat()?;
        if self.lock.is_some() {
            if let Err(err) = self.refresh_lock() {
                tracing::warn!(key = %self.lock_key, error = %err, "failed to refresh lock on heartbeat");
                if self.timer.in_context() {
                    return Err(WatchdogError::HeartbeatLock {
                        key: self.lock_key.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        } else if self.timer.in_context() {
            return Err(WatchdogError::LockUndefined { key: self.lock_key.clone() });
        }
        Ok(())
    }

    /// Timer health first; inside a step the lock is additionally loaded
    /// by its shared lease id, reconstructed and refreshed, so the check
    /// works from either side of the fork.
    fn check_health(&self) -> Result<(), WatchdogError> {
        self.timer.check_health()?;
        if !self.timer.in_context() {
            return Ok(());
        }
        let lease_id = self.shared_lease_id()?;
        let lease = self.client.lease(lease_id).map_err(|err| self.status_error(err))?;
        let lock = self
            .client
            .lock_from_lease(&lease)
            .map_err(|err| self.status_error(err))?;
        // Refresh only: the lock must never be released mid-step.
        self.client.refresh(&lock).map_err(|err| self.status_error(err))?;
        Ok(())
    }

    fn mark_failed(&mut self) {
        self.timer.mark_failed();
    }

    /// Release the lock if held, swallowing errors.
    fn teardown(&mut self) {
        if let Some(lock) = self.lock.take() {
            tracing::debug!(key = %lock.key, id = lock.id, "releasing lock");
            match self.client.release(&lock) {
                Ok(()) => tracing::info!(key = %lock.key, id = lock.id, "released lock"),
                Err(err) => {
                    tracing::warn!(key = %lock.key, id = lock.id, error = %err, "failed to release lock");
                }
            }
        }
        self.timer.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryKvClient;
    use crate::watchdog::Severity;

    const HEARTBEAT: Duration = Duration::from_secs(10);

    fn client() -> Arc<MemoryKvClient> {
        Arc::new(MemoryKvClient::new(Duration::from_secs(1)))
    }

    fn watchdog(client: &Arc<MemoryKvClient>) -> LeaseWatchdog {
        LeaseWatchdog::new(
            HEARTBEAT,
            client.clone(),
            "svc/lock",
            LeaseOptions { label: Some("test-host".into()), ..Default::default() },
        )
        .unwrap()
    }

    #[test]
    fn ttl_floor_is_enforced() {
        let client = client();
        let min = LeaseWatchdog::min_ttl(HEARTBEAT, client.timeout());
        assert_eq!(min, Duration::from_secs(36));

        let err = LeaseWatchdog::new(
            HEARTBEAT,
            client.clone(),
            "svc/lock",
            LeaseOptions { ttl: Some(Duration::from_secs(2)), ..Default::default() },
        )
        .unwrap_err();
        assert!(matches!(err, WatchdogError::UnsafeLockTtl { .. }));

        let wd = LeaseWatchdog::new(
            HEARTBEAT,
            client,
            "svc/lock",
            LeaseOptions {
                ttl: Some(Duration::from_secs(2)),
                unsafe_ttl: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(wd.lock_ttl(), Duration::from_secs(2));
    }

    #[test]
    fn enter_acquires_the_lock_and_mirrors_the_lease() {
        let client = client();
        let mut wd = watchdog(&client);
        wd.enter().unwrap();
        assert_eq!(client.holder("svc/lock").as_deref(), Some("test-host"));
        assert!(wd.lease_defined.load() != 0);
        assert_eq!(wd.lease_id.load(), wd.lock.as_ref().unwrap().id);
        wd.exit();
        assert!(!wd.timer.in_context());
    }

    #[test]
    fn occupied_lock_is_a_minor_failure() {
        let client = client();
        client.acquire("svc/lock", Duration::from_secs(60), "other").unwrap();
        let mut wd = watchdog(&client);
        let err = wd.enter().unwrap_err();
        assert_eq!(err.severity(), Severity::Minor);
        assert!(matches!(err, WatchdogError::LockAcquire { .. }));
        assert!(!wd.timer.in_context());
    }

    #[test]
    fn creation_failure_is_critical() {
        let client = client();
        client.inject_fault(KvError::LockCreate { reason: "connection refused".into() });
        let mut wd = watchdog(&client);
        let err = wd.enter().unwrap_err();
        assert_eq!(err.severity(), Severity::Critical);
        assert!(matches!(err, WatchdogError::LockCreate { .. }));
    }

    #[test]
    fn refresh_failure_inside_a_step_is_critical() {
        let client = client();
        let mut wd = watchdog(&client);
        wd.enter().unwrap();
        // shared flag is still set between enter and exit

        client.inject_fault(KvError::Transport { reason: "etcd away".into() });
        let err = wd.generate_heartbeat().unwrap_err();
        assert!(matches!(err, WatchdogError::HeartbeatLock { .. }));
        assert_eq!(err.severity(), Severity::Critical);
    }

    #[test]
    fn refresh_failure_outside_a_step_is_logged_only() {
        let client = client();
        let mut wd = watchdog(&client);
        wd.enter().unwrap();
        wd.exit();

        client.inject_fault(KvError::Transport { reason: "etcd away".into() });
        assert!(wd.generate_heartbeat().is_ok());
    }

    #[test]
    fn health_check_reconstructs_the_lock_from_the_lease() {
        let client = client();
        let mut wd = watchdog(&client);
        wd.enter().unwrap();
        // shared flag is still set between enter and exit
        assert!(wd.check_health().is_ok());

        client.inject_fault(KvError::LeaseExpired { id: wd.lock.as_ref().unwrap().id });
        let err = wd.check_health().unwrap_err();
        assert!(matches!(err, WatchdogError::LockExpired { .. }));
    }

    #[test]
    fn undefined_lock_inside_a_step_is_critical() {
        let client = client();
        let mut wd = watchdog(&client);
        wd.enter().unwrap();
        wd.set_lock(None);
        let err = wd.generate_heartbeat().unwrap_err();
        assert!(matches!(err, WatchdogError::LockUndefined { .. }));
        let err = wd.check_health().unwrap_err();
        assert!(matches!(err, WatchdogError::LockUndefined { .. }));
    }

    #[test]
    fn teardown_releases_the_lock() {
        let client = client();
        let mut wd = watchdog(&client);
        wd.enter().unwrap();
        wd.exit();
        wd.teardown();
        assert_eq!(client.holder("svc/lock"), None);
    }

    #[test]
    fn expired_lock_is_reacquired_on_the_next_enter() {
        let client = client();
        let mut wd = LeaseWatchdog::new(
            HEARTBEAT,
            client.clone(),
            "svc/lock",
            LeaseOptions {
                label: Some("test-host".into()),
                ttl: Some(Duration::from_millis(50)),
                unsafe_ttl: true,
                ..Default::default()
            },
        )
        .unwrap();
        wd.enter().unwrap();
        wd.exit();
        let first = wd.lock.as_ref().unwrap().id;
        // Let the lock lapse between steps; the next enter refreshes,
        // observes the expiry and acquires a fresh lease.
        std::thread::sleep(Duration::from_millis(60));
        wd.enter().unwrap();
        assert!(wd.lock.as_ref().unwrap().id > first);
        wd.exit();
    }
}
