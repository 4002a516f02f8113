//! Logging facade.
//!
//! There is exactly one process-wide datum in the supervisor: the root
//! log level, toggled between INFO and DEBUG by the SIGUSR1 path. It
//! lives here, behind a reloadable filter layer.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

static RELOAD: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();
static DEBUG: AtomicBool = AtomicBool::new(false);

/// Install the process-wide subscriber: env-filtered (`RUST_LOG`,
/// default `info`) with a reloadable root level. Later calls are no-ops
/// when a subscriber is already installed.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();
    if installed {
        let _ = RELOAD.set(handle);
    }
}

/// Flip the root level between INFO and DEBUG.
pub fn toggle_debug() {
    let Some(handle) = RELOAD.get() else {
        tracing::warn!("logging facade not initialized; cannot toggle level");
        return;
    };
    let debug = !DEBUG.fetch_xor(true, Ordering::SeqCst);
    let directive = if debug { "debug" } else { "info" };
    if handle.modify(|filter| *filter = EnvFilter::new(directive)).is_err() {
        tracing::warn!("failed to reload log filter");
        return;
    }
    tracing::info!(level = directive, "root log level toggled");
}

/// Whether the toggle currently selects DEBUG.
pub fn is_debug() -> bool {
    DEBUG.load(Ordering::SeqCst)
}
