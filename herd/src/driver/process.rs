//! Fork-based process driver.
//!
//! Each declared service runs in its own forked child process. Fork is
//! used (rather than spawn-and-exec) so the watchdog cells allocated by
//! the service factory are inherited by the worker; the parent keeps the
//! same service instance and reads liveness through it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use uuid::Uuid;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::service::Service;
use crate::state::State;
use crate::unit::ServiceFactory;

/// How long the SIGKILL path waits for the child to be reaped.
const KILL_JOIN_TIMEOUT: Duration = Duration::from_millis(100);
/// Poll interval for bounded joins.
const JOIN_POLL_PERIOD: Duration = Duration::from_millis(10);

fn decode(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        // multiprocessing convention: death by signal s is -s
        WaitStatus::Signaled(_, signal, _) => Some(-(signal as i32)),
        _ => None,
    }
}

/// Handle to one forked worker process.
#[derive(Debug, Default)]
struct ChildProc {
    pid: Option<Pid>,
    exitcode: Option<i32>,
}

impl ChildProc {
    /// Reap without blocking. The wait status is cached: a process can
    /// only be reaped once, but callers observe the exit code forever.
    fn exitcode(&mut self) -> Option<i32> {
        if self.exitcode.is_some() {
            return self.exitcode;
        }
        let pid = self.pid?;
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => {
                self.exitcode = decode(status);
                self.exitcode
            }
            Err(nix::Error::EINTR) => None,
            Err(err) => {
                tracing::warn!(%pid, error = %err, "waitpid failed");
                None
            }
        }
    }

    /// Join the child. Returns true when the child has exited (or never
    /// started), false when a bounded wait elapsed.
    fn join(&mut self, timeout: Option<Duration>) -> bool {
        if self.exitcode.is_some() {
            return true;
        }
        let Some(pid) = self.pid else {
            return true;
        };
        match timeout {
            None => loop {
                match waitpid(pid, None) {
                    Ok(status) => {
                        if let Some(code) = decode(status) {
                            self.exitcode = Some(code);
                            return true;
                        }
                    }
                    Err(nix::Error::EINTR) => {}
                    Err(err) => {
                        tracing::warn!(%pid, error = %err, "waitpid failed while joining");
                        return true;
                    }
                }
            },
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    if self.exitcode().is_some() {
                        return true;
                    }
                    if Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::sleep(JOIN_POLL_PERIOD.min(limit));
                }
            }
        }
    }
}

/// Driver-side record for one declared service.
struct ServiceEntry {
    factory: ServiceFactory,
    service: Box<dyn Service>,
    child: ChildProc,
    forcibly_stopped: bool,
}

/// Serves services as forked child processes.
pub struct ProcessDriver {
    services: BTreeMap<Uuid, ServiceEntry>,
}

impl ProcessDriver {
    const TARGET_STATES: [State; 2] = [State::Running, State::Stopped];

    pub fn new() -> Self {
        Self { services: BTreeMap::new() }
    }

    /// Raw OS pid of a service's worker, if started.
    pub fn service_pid(&self, uuid: Uuid) -> Result<Option<i32>> {
        let entry = self.services.get(&uuid).ok_or(Error::ServiceNotFound { uuid })?;
        Ok(entry.child.pid.map(Pid::as_raw))
    }

    /// Exit code of a service's worker, if it has exited. Death by
    /// signal `s` reads as `-s` (SIGTERM termination is -15).
    pub fn service_exitcode(&mut self, uuid: Uuid) -> Result<Option<i32>> {
        let entry = self.services.get_mut(&uuid).ok_or(Error::ServiceNotFound { uuid })?;
        Ok(entry.child.exitcode())
    }

    /// Rebuild the service record from its factory: fresh service, fresh
    /// watchdog cells, cleared process handle and stop mark.
    fn init_entry(entry: &mut ServiceEntry) {
        entry.service = (entry.factory)();
        entry.child = ChildProc::default();
        entry.forcibly_stopped = false;
    }

    fn start(entry: &mut ServiceEntry) -> Result<()> {
        match unsafe { fork() }? {
            ForkResult::Child => {
                let code = match entry.service.serve() {
                    Ok(()) => 0,
                    Err(err) => {
                        tracing::error!(error = %err, "service exited with error");
                        1
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                tracing::debug!(pid = %child, "started worker process");
                entry.child.pid = Some(child);
                Ok(())
            }
        }
    }

    /// Observed state from the OS process handle alone.
    fn process_state(child: &mut ChildProc) -> State {
        if child.pid.is_none() {
            return State::Initial;
        }
        match child.exitcode() {
            None => State::Running,
            Some(code) if code == 0 || code == -(Signal::SIGTERM as i32) => State::Stopped,
            Some(_) => State::Failed,
        }
    }

    /// Observed state with the driver overrides applied: the manual stop
    /// mark wins whenever the process is not running; a running process
    /// with a stale watchdog is numb.
    fn service_state(entry: &mut ServiceEntry) -> State {
        let raw = Self::process_state(&mut entry.child);
        if entry.forcibly_stopped && raw != State::Running {
            return State::Stopped;
        }
        if raw == State::Running && !entry.service.watchdog().is_alive() {
            return State::Numb;
        }
        raw
    }

    fn restart(uuid: Uuid, entry: &mut ServiceEntry) -> Result<()> {
        let state = Self::process_state(&mut entry.child);
        if state == State::Running {
            return Err(Error::UnexpectedServiceState { uuid, state });
        }
        Self::init_entry(entry);
        Self::start(entry)
    }

    fn terminate(uuid: Uuid, entry: &mut ServiceEntry) {
        let Some(pid) = entry.child.pid else {
            tracing::debug!(%uuid, "terminate on a never-started worker");
            return;
        };
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            tracing::warn!(%uuid, %pid, error = %err, "failed to terminate worker");
        }
    }

    fn kill_entry(uuid: Uuid, entry: &mut ServiceEntry) {
        if Self::process_state(&mut entry.child) != State::Running {
            // it shouldn't happen, but if it would - we should notice
            tracing::error!(%uuid, "tried to kill a service that is not running");
            return;
        }
        let Some(pid) = entry.child.pid else {
            return;
        };
        if let Err(err) = kill(pid, Signal::SIGKILL) {
            tracing::warn!(%uuid, %pid, error = %err, "failed to kill worker");
        }
        if !entry.child.join(Some(KILL_JOIN_TIMEOUT)) {
            tracing::warn!(
                %uuid,
                %pid,
                timeout_s = KILL_JOIN_TIMEOUT.as_secs_f64(),
                "timed out joining killed worker"
            );
        }
    }

    fn kill_and_restart(uuid: Uuid, entry: &mut ServiceEntry) -> Result<()> {
        Self::kill_entry(uuid, entry);
        let state = Self::process_state(&mut entry.child);
        if state == State::Running {
            return Err(Error::UnexpectedServiceState { uuid, state });
        }
        Self::init_entry(entry);
        Self::start(entry)
    }
}

impl Default for ProcessDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for ProcessDriver {
    fn validate_target_state(&self, state: State) -> Result<()> {
        if Self::TARGET_STATES.contains(&state) {
            Ok(())
        } else {
            Err(Error::DriverUnsupportedState { state })
        }
    }

    fn get_states(&mut self) -> BTreeMap<Uuid, State> {
        self.services
            .iter_mut()
            .map(|(uuid, entry)| (*uuid, Self::service_state(entry)))
            .collect()
    }

    fn set_state(&mut self, uuid: Uuid, old: State, new: State) -> Result<()> {
        self.validate_target_state(new)?;
        if old == new {
            return Ok(());
        }
        tracing::debug!(%uuid, %old, %new, "changing service state");
        let entry = self.services.get_mut(&uuid).ok_or(Error::ServiceNotFound { uuid })?;
        match (old, new) {
            (State::Initial, State::Running) => Self::start(entry),
            (State::Initial, State::Stopped) | (State::Failed, State::Stopped) => {
                entry.forcibly_stopped = true;
                Ok(())
            }
            (State::Running, State::Stopped) => {
                Self::terminate(uuid, entry);
                Ok(())
            }
            (State::Stopped, State::Running) | (State::Failed, State::Running) => {
                Self::restart(uuid, entry)
            }
            (State::Numb, State::Running) => Self::kill_and_restart(uuid, entry),
            (State::Numb, State::Stopped) => {
                Self::kill_entry(uuid, entry);
                Ok(())
            }
            (from, to) => Err(Error::TransitionNotSupported { from, to }),
        }
    }

    fn add_service(&mut self, uuid: Uuid, factory: ServiceFactory) -> Result<()> {
        if self.services.contains_key(&uuid) {
            return Err(Error::ServiceExists { uuid });
        }
        let service = factory();
        self.services.insert(
            uuid,
            ServiceEntry { factory, service, child: ChildProc::default(), forcibly_stopped: false },
        );
        tracing::info!(%uuid, state = %State::Initial, "added service target");
        Ok(())
    }

    fn remove_service(&mut self, uuid: Uuid) -> Result<()> {
        if !self.services.contains_key(&uuid) {
            return Err(Error::ServiceNotFound { uuid });
        }
        tracing::info!(%uuid, "removing service target");
        self.stop_service(uuid)?;
        self.wait_service(uuid, None)?;
        self.services.remove(&uuid);
        tracing::info!(%uuid, "removed service target");
        Ok(())
    }

    fn stop_service(&mut self, uuid: Uuid) -> Result<()> {
        let entry = self.services.get_mut(&uuid).ok_or(Error::ServiceNotFound { uuid })?;
        tracing::info!(%uuid, "stopping service");
        Self::terminate(uuid, entry);
        Ok(())
    }

    fn stop_all_services(&mut self) {
        tracing::info!("stopping all services");
        for (uuid, entry) in self.services.iter_mut() {
            tracing::debug!(%uuid, "stopping service");
            Self::terminate(*uuid, entry);
        }
    }

    fn wait_service(&mut self, uuid: Uuid, timeout: Option<Duration>) -> Result<()> {
        let entry = self.services.get_mut(&uuid).ok_or(Error::ServiceNotFound { uuid })?;
        tracing::debug!(%uuid, "waiting for service");
        match timeout {
            Some(limit) if !entry.child.join(Some(limit)) => {
                Err(Error::ServiceWaitTimeout { uuid, timeout: limit })
            }
            Some(_) => Ok(()),
            None => {
                entry.child.join(None);
                Ok(())
            }
        }
    }

    fn wait_all_services(&mut self) {
        tracing::info!("waiting for all services");
        for (uuid, entry) in self.services.iter_mut() {
            tracing::debug!(%uuid, "waiting for service");
            entry.child.join(None);
        }
    }
}
