//! Coordination-service contract.
//!
//! The supervisor core does not ship a full KV client. It defines the
//! lock primitive a lease-backed watchdog needs, typed errors, an
//! in-process implementation ([`MemoryKvClient`]) and, behind the
//! `etcd` cargo feature, an implementation over an etcd cluster
//! ([`EtcdKvClient`]).

#[cfg(feature = "etcd")]
mod etcd;
mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdKvClient;
pub use memory::MemoryKvClient;

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Typed failures of the KV lock primitive.
#[derive(Error, Debug)]
pub enum KvError {
    /// Another holder currently owns the lock.
    #[error("lock {key} is already occupied")]
    LockAlreadyOccupied { key: String },

    /// The lock's lease has lapsed.
    #[error("lock has expired")]
    LockExpired,

    /// The lock could not be created at all (network-level failure).
    #[error("failed to create lock: {reason}")]
    LockCreate { reason: String },

    /// The lease is gone.
    #[error("lease {id} has expired")]
    LeaseExpired { id: i64 },

    /// Transport-level failure talking to the coordination service.
    #[error("coordination transport error: {reason}")]
    Transport { reason: String },
}

/// Handle to a held (or lease-reconstructed) distributed lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Lease id backing the lock.
    pub id: i64,
    /// Full key under which the lock is held.
    pub key: String,
}

/// A lease looked up by id, with the keys attached to it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: i64,
    pub keys: Vec<String>,
}

/// Coordination client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    /// Cluster endpoints, e.g. `["http://127.0.0.1:2379"]`.
    pub endpoints: Vec<String>,
    /// Optional prefix applied to every key.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Per-RPC timeout [s].
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
}

fn default_timeout_secs() -> f64 {
    5.0
}

impl KvConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    /// Key with the configured namespace prefix applied.
    pub fn prefixed_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}{key}"),
            None => key.to_string(),
        }
    }
}

/// Synchronous lock primitive offered by a coordination service.
///
/// A lock is acquired under a lease with a TTL; refreshing the lock
/// extends the lease. A process that only knows the lease id (a forked
/// peer) looks the lease up and reconstructs the lock handle from it.
pub trait KvClient: Send + Sync {
    /// Acquire `(key, ttl, label)`; returns the held lock.
    fn acquire(&self, key: &str, ttl: Duration, label: &str) -> Result<LockHandle, KvError>;

    /// Extend the lock's lease.
    fn refresh(&self, lock: &LockHandle) -> Result<(), KvError>;

    /// Give the lock up.
    fn release(&self, lock: &LockHandle) -> Result<(), KvError>;

    /// Look a lease up by id.
    fn lease(&self, lease_id: i64) -> Result<Lease, KvError>;

    /// Reconstruct the lock handle a lease is backing.
    fn lock_from_lease(&self, lease: &Lease) -> Result<LockHandle, KvError>;

    /// Configured per-RPC timeout; feeds the watchdog TTL safety floor.
    fn timeout(&self) -> Duration;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_prefix() {
        let config: KvConfig =
            toml::from_str(r#"endpoints = ["http://127.0.0.1:2379"]"#).unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.prefixed_key("svc/lock"), "svc/lock");

        let config: KvConfig = toml::from_str(
            r#"
endpoints = ["http://127.0.0.1:2379"]
namespace = "/herd/"
timeout_secs = 0.5
"#,
        )
        .unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.prefixed_key("svc/lock"), "/herd/svc/lock");
    }
}
