//! Process signal plumbing.
//!
//! Signal handlers never run user code: they only deposit into
//! process-global atomics, which the service loop drains between steps.
//! Supervisor-to-worker signal forwarding goes through a fork-shared
//! [`SignalCell`] instead of OS signals, keeping the same indirection.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use herd_shm::{ShmResult, SharedWord};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);
static PENDING_FORWARD: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_stop_signal(_signum: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_forward_signal(signum: libc::c_int) {
    PENDING_FORWARD.store(signum, Ordering::SeqCst);
}

/// Whether SIGINT/SIGTERM asked this process to stop.
pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// Drain the latched forwardable signal (0 = none pending).
pub fn take_forward_signal() -> i32 {
    PENDING_FORWARD.swap(0, Ordering::SeqCst)
}

/// Clear flags inherited across `fork`; called at serve start.
pub fn reset() {
    STOP_REQUESTED.store(false, Ordering::SeqCst);
    PENDING_FORWARD.store(0, Ordering::SeqCst);
}

/// Which disposition set a serving process installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRole {
    /// Child worker: SIGHUP/SIGUSR1 arrive via the signal cell, so the
    /// OS-level ones are ignored.
    Worker,
    /// Supervisor: SIGHUP/SIGUSR1 are latched for forwarding to workers.
    Hub,
}

/// Install dispositions for serving: SIGINT/SIGTERM request a stop,
/// SIGCHLD keeps its default disposition (the driver reaps through
/// waitpid), SIGKILL/SIGSTOP cannot be caught, and every other signal
/// is explicitly ignored during operation.
pub fn subscribe(role: SignalRole) -> nix::Result<()> {
    let stop = SigAction::new(SigHandler::Handler(on_stop_signal), SaFlags::empty(), SigSet::empty());
    let forward =
        SigAction::new(SigHandler::Handler(on_forward_signal), SaFlags::empty(), SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    for signal in Signal::iterator() {
        let action = match signal {
            Signal::SIGINT | Signal::SIGTERM => &stop,
            Signal::SIGHUP | Signal::SIGUSR1 if role == SignalRole::Hub => &forward,
            Signal::SIGKILL | Signal::SIGSTOP | Signal::SIGCHLD => continue,
            _ => &ignore,
        };
        unsafe { sigaction(signal, action) }?;
    }
    tracing::info!(?role, "subscribed signals");
    Ok(())
}

/// Install only the stop handlers, leaving everything else at its
/// default disposition. Used by the non-operating serve path.
pub fn subscribe_stop_only() -> nix::Result<()> {
    let stop = SigAction::new(SigHandler::Handler(on_stop_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGINT, &stop)?;
        sigaction(Signal::SIGTERM, &stop)?;
    }
    Ok(())
}

/// Fork-shared mailbox for supervisor-to-worker signal forwarding.
///
/// The supervisor posts a signal number; the worker loop drains the cell
/// between steps and dispatches to its handler table.
#[derive(Clone, Debug)]
pub struct SignalCell {
    word: SharedWord,
}

impl SignalCell {
    pub fn new() -> ShmResult<Self> {
        Ok(Self { word: SharedWord::new(0)? })
    }

    /// Deposit a signal number for the worker to pick up.
    pub fn post(&self, signum: i32) {
        self.word.store(signum as i64);
    }

    /// Return and clear the pending signal number (0 = none).
    pub fn take(&self) -> i32 {
        self.word.swap(0) as i32
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn signal_cell_is_drained_once() {
        let cell = SignalCell::new().unwrap();
        assert_eq!(cell.take(), 0);
        cell.post(libc::SIGHUP);
        assert_eq!(cell.take(), libc::SIGHUP);
        assert_eq!(cell.take(), 0);
    }

    #[test]
    #[serial]
    fn reset_clears_latched_state() {
        STOP_REQUESTED.store(true, Ordering::SeqCst);
        PENDING_FORWARD.store(libc::SIGUSR1, Ordering::SeqCst);
        reset();
        assert!(!stop_requested());
        assert_eq!(take_forward_signal(), 0);
    }
}
