//! TOML configuration loading and the watchdog factory.
//!
//! Operators describe loop pacing and the watchdog flavour in TOML;
//! [`WatchdogConfig::build`] turns the description into a live watchdog.
//! Lease-backed watchdogs need the `etcd` cargo feature.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::coord::KvConfig;
use crate::watchdog::{NoopWatchdog, TimedWatchdog, Watchdog};

/// Configuration loading/validation error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File I/O error.
    #[error("config I/O error: {0}")]
    Io(String),

    /// TOML parse error.
    #[error("config parse error: {0}")]
    Parse(String),

    /// Parameter validation error.
    #[error("config validation: {0}")]
    Validation(String),

    /// The described component needs a cargo feature that is not built.
    #[error("{component} requires the `{feature}` cargo feature")]
    FeatureDisabled { component: &'static str, feature: &'static str },

    /// Watchdog construction failed.
    #[error(transparent)]
    Watchdog(#[from] crate::watchdog::WatchdogError),
}

/// Loop pacing for a soft-irq service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Minimal period between step starts [s].
    pub step_period_secs: f64,
    /// Pause between loop passes [s]; 0 sleeps precisely until the next
    /// step is due.
    pub loop_period_secs: f64,
    /// Whether the service performs work or only parks awaiting signals.
    pub operate: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { step_period_secs: 1.0, loop_period_secs: 0.1, operate: true }
    }
}

impl LoopConfig {
    pub fn step_period(&self) -> Duration {
        Duration::from_secs_f64(self.step_period_secs)
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_secs_f64(self.loop_period_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step_period_secs < 0.0 || !self.step_period_secs.is_finite() {
            return Err(ConfigError::Validation(format!(
                "step_period_secs must be a non-negative number, got {}",
                self.step_period_secs
            )));
        }
        if self.loop_period_secs < 0.0 || !self.loop_period_secs.is_finite() {
            return Err(ConfigError::Validation(format!(
                "loop_period_secs must be a non-negative number, got {}",
                self.loop_period_secs
            )));
        }
        Ok(())
    }
}

/// Watchdog selection, keyed by type.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchdogConfig {
    /// No liveness checks.
    Noop,
    /// Shared-timer heartbeat.
    Timed {
        heartbeat_timeout_secs: f64,
    },
    /// Timer plus distributed lock (requires the `etcd` feature).
    Lease {
        heartbeat_timeout_secs: f64,
        lock_key: String,
        #[serde(default)]
        lock_label: Option<String>,
        #[serde(default)]
        lock_ttl_secs: Option<f64>,
        #[serde(default)]
        unsafe_lock_ttl: bool,
        kv: KvConfig,
    },
}

impl WatchdogConfig {
    /// Build the configured watchdog. Every call allocates fresh cells,
    /// so call it from inside a service factory.
    pub fn build(&self) -> Result<Box<dyn Watchdog>, ConfigError> {
        match self {
            WatchdogConfig::Noop => Ok(Box::new(NoopWatchdog::new())),
            WatchdogConfig::Timed { heartbeat_timeout_secs } => Ok(Box::new(TimedWatchdog::new(
                Duration::from_secs_f64(*heartbeat_timeout_secs),
            )?)),
            #[cfg(feature = "etcd")]
            WatchdogConfig::Lease {
                heartbeat_timeout_secs,
                lock_key,
                lock_label,
                lock_ttl_secs,
                unsafe_lock_ttl,
                kv,
            } => {
                use std::sync::Arc;

                use crate::coord::EtcdKvClient;
                use crate::watchdog::{LeaseOptions, LeaseWatchdog};

                let client = Arc::new(EtcdKvClient::new(kv.clone()));
                let options = LeaseOptions {
                    label: lock_label.clone(),
                    ttl: lock_ttl_secs.map(Duration::from_secs_f64),
                    unsafe_ttl: *unsafe_lock_ttl,
                };
                Ok(Box::new(LeaseWatchdog::new(
                    Duration::from_secs_f64(*heartbeat_timeout_secs),
                    client,
                    lock_key.clone(),
                    options,
                )?))
            }
            #[cfg(not(feature = "etcd"))]
            WatchdogConfig::Lease { .. } => {
                Err(ConfigError::FeatureDisabled { component: "lease watchdog", feature: "etcd" })
            }
        }
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Io(format!("failed to read {}: {err}", path.display())))?;
    toml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))
}

/// Load and validate a [`LoopConfig`] from a TOML file.
pub fn load_loop_config(path: &Path) -> Result<LoopConfig, ConfigError> {
    let config: LoopConfig = read_toml(path)?;
    config.validate()?;
    Ok(config)
}

/// Load a [`WatchdogConfig`] from a TOML file.
pub fn load_watchdog_config(path: &Path) -> Result<WatchdogConfig, ConfigError> {
    read_toml(path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loop_config_defaults() {
        let config: LoopConfig = toml::from_str("").unwrap();
        assert_eq!(config.step_period(), Duration::from_secs(1));
        assert_eq!(config.loop_period(), Duration::from_millis(100));
        assert!(config.operate);
    }

    #[test]
    fn loop_config_rejects_negative_periods() {
        let config: LoopConfig = toml::from_str("step_period_secs = -1.0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn watchdog_config_parses_all_flavours() {
        let noop: WatchdogConfig = toml::from_str(r#"type = "noop""#).unwrap();
        assert!(matches!(noop, WatchdogConfig::Noop));

        let timed: WatchdogConfig = toml::from_str(
            r#"
type = "timed"
heartbeat_timeout_secs = 30.0
"#,
        )
        .unwrap();
        assert!(matches!(
            timed,
            WatchdogConfig::Timed { heartbeat_timeout_secs } if heartbeat_timeout_secs == 30.0
        ));

        let lease: WatchdogConfig = toml::from_str(
            r#"
type = "lease"
heartbeat_timeout_secs = 30.0
lock_key = "prod/worker"
lock_ttl_secs = 120.0

[kv]
endpoints = ["http://127.0.0.1:2379"]
namespace = "/herd/"
timeout_secs = 2.0
"#,
        )
        .unwrap();
        match lease {
            WatchdogConfig::Lease { lock_key, lock_ttl_secs, unsafe_lock_ttl, kv, .. } => {
                assert_eq!(lock_key, "prod/worker");
                assert_eq!(lock_ttl_secs, Some(120.0));
                assert!(!unsafe_lock_ttl);
                assert_eq!(kv.timeout(), Duration::from_secs(2));
            }
            other => panic!("expected lease config, got {other:?}"),
        }
    }

    #[test]
    fn noop_and_timed_build() {
        assert!(WatchdogConfig::Noop.build().is_ok());
        let timed = WatchdogConfig::Timed { heartbeat_timeout_secs: 5.0 };
        assert!(timed.build().is_ok());
    }

    #[cfg(not(feature = "etcd"))]
    #[test]
    fn lease_without_the_feature_is_an_error() {
        let lease: WatchdogConfig = toml::from_str(
            r#"
type = "lease"
heartbeat_timeout_secs = 30.0
lock_key = "prod/worker"

[kv]
endpoints = ["http://127.0.0.1:2379"]
"#,
        )
        .unwrap();
        assert!(matches!(lease.build(), Err(ConfigError::FeatureDisabled { .. })));
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "step_period_secs = \"fast\"").unwrap();
        let err = load_loop_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = load_loop_config(Path::new("/nonexistent/herd.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn load_loop_config_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "step_period_secs = 0.5\nloop_period_secs = 0.0\noperate = false").unwrap();
        let config = load_loop_config(file.path()).unwrap();
        assert_eq!(config.step_period(), Duration::from_millis(500));
        assert!(config.loop_period().is_zero());
        assert!(!config.operate);
    }
}
