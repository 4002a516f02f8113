//! Shared helpers for in-crate tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::service::{Service, StepError};
use crate::state::State;
use crate::unit::ServiceFactory;
use crate::watchdog::{NoopWatchdog, Watchdog};

/// Trivial service that never runs; enough for registration tests.
pub(crate) struct NoopService {
    watchdog: NoopWatchdog,
}

impl Service for NoopService {
    fn serve(&mut self) -> std::result::Result<(), StepError> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn watchdog(&self) -> &dyn Watchdog {
        &self.watchdog
    }
}

pub(crate) fn noop_factory() -> ServiceFactory {
    Arc::new(|| Box::new(NoopService { watchdog: NoopWatchdog::new() }))
}

/// Scripted driver: states are set directly, transitions are recorded.
/// The shutdown flags are shared so tests can keep a handle after the
/// driver is boxed away inside a hub.
#[derive(Default)]
pub(crate) struct StubDriver {
    pub states: BTreeMap<Uuid, State>,
    pub set_calls: Vec<(Uuid, State, State)>,
    pub removed: Vec<Uuid>,
    pub stopped_all: Arc<AtomicBool>,
    pub waited_all: Arc<AtomicBool>,
    pub fail_set_state: bool,
}

impl Driver for StubDriver {
    fn validate_target_state(&self, state: State) -> Result<()> {
        match state {
            State::Running | State::Stopped => Ok(()),
            state => Err(Error::DriverUnsupportedState { state }),
        }
    }

    fn get_states(&mut self) -> BTreeMap<Uuid, State> {
        self.states.clone()
    }

    fn set_state(&mut self, uuid: Uuid, old: State, new: State) -> Result<()> {
        self.validate_target_state(new)?;
        if old == new {
            return Ok(());
        }
        self.set_calls.push((uuid, old, new));
        if self.fail_set_state {
            return Err(Error::UnexpectedServiceState { uuid, state: old });
        }
        self.states.insert(uuid, new);
        Ok(())
    }

    fn add_service(&mut self, uuid: Uuid, _factory: ServiceFactory) -> Result<()> {
        if self.states.contains_key(&uuid) {
            return Err(Error::ServiceExists { uuid });
        }
        self.states.insert(uuid, State::Initial);
        Ok(())
    }

    fn remove_service(&mut self, uuid: Uuid) -> Result<()> {
        if self.states.remove(&uuid).is_none() {
            return Err(Error::ServiceNotFound { uuid });
        }
        self.removed.push(uuid);
        Ok(())
    }

    fn stop_service(&mut self, _uuid: Uuid) -> Result<()> {
        Ok(())
    }

    fn stop_all_services(&mut self) {
        self.stopped_all.store(true, Ordering::SeqCst);
    }

    fn wait_service(&mut self, _uuid: Uuid, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn wait_all_services(&mut self) {
        self.waited_all.store(true, Ordering::SeqCst);
    }
}
