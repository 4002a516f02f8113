//! Reconciliation controllers.
//!
//! A controller makes one `manage` pass over all units, comparing the
//! hub's declared targets against the driver's observed states, and
//! issues transitions. Its `stop` flag is honoured at the top of each
//! per-unit iteration; an in-flight transition runs to completion.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::state::State;

/// A reconciliation policy.
pub trait Controller: Send {
    /// One pass over all units. `targets` is the hub's declared map.
    fn manage(&mut self, targets: &BTreeMap<Uuid, State>, driver: &mut dyn Driver) -> Result<()>;

    /// Abort the current and future passes.
    fn stop(&mut self, driver: &mut dyn Driver);
}

/// Forces every unit toward its declared target, unconditionally.
#[derive(Debug, Default)]
pub struct ForceTargetController {
    stopping: bool,
}

impl ForceTargetController {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Controller for ForceTargetController {
    fn manage(&mut self, targets: &BTreeMap<Uuid, State>, driver: &mut dyn Driver) -> Result<()> {
        let current = driver.get_states();
        for (uuid, target) in targets {
            if self.stopping {
                tracing::info!("aborting state management");
                return Ok(());
            }
            let current_state =
                *current.get(uuid).ok_or(Error::ServiceNotFound { uuid: *uuid })?;
            driver.set_state(*uuid, current_state, *target)?;
        }
        Ok(())
    }

    fn stop(&mut self, _driver: &mut dyn Driver) {
        tracing::info!("stopping controller");
        self.stopping = true;
    }
}

/// Stops the whole hub as soon as any unit reaches a panic state.
///
/// Units in a panic state trigger a best-effort fast stop of everything,
/// then a [`Error::StopHub`]; healthy units are forced toward their
/// targets as usual.
pub struct PanicController {
    panic_states: Vec<State>,
    stopping: bool,
}

impl PanicController {
    /// Panics on `Failed` and `Numb`.
    pub fn new() -> Self {
        Self::with_panic_states([State::Failed, State::Numb])
    }

    pub fn with_panic_states(states: impl IntoIterator<Item = State>) -> Self {
        Self { panic_states: states.into_iter().collect(), stopping: false }
    }

    fn fast_stop(&self, current: &BTreeMap<Uuid, State>, driver: &mut dyn Driver) {
        tracing::info!("stopping all services");
        for (uuid, state) in current {
            if let Err(err) = driver.set_state(*uuid, *state, State::Stopped) {
                tracing::error!(%uuid, error = %err, "ignoring error while fast-stopping");
            }
        }
    }
}

impl Default for PanicController {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller for PanicController {
    fn manage(&mut self, targets: &BTreeMap<Uuid, State>, driver: &mut dyn Driver) -> Result<()> {
        let current = driver.get_states();
        for (uuid, target) in targets {
            if self.stopping {
                tracing::info!("aborting state management");
                return Ok(());
            }
            let current_state =
                *current.get(uuid).ok_or(Error::ServiceNotFound { uuid: *uuid })?;
            if self.panic_states.contains(&current_state) {
                let reason = format!("unit {uuid} has reached unexpected state {current_state}");
                tracing::error!(%uuid, state = %current_state, "panic state reached");
                self.fast_stop(&current, driver);
                return Err(Error::StopHub { reason });
            }
            driver.set_state(*uuid, current_state, *target)?;
        }
        Ok(())
    }

    fn stop(&mut self, _driver: &mut dyn Driver) {
        tracing::info!("stopping controller");
        self.stopping = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubDriver;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn force_target_sets_every_unit() {
        let mut driver = StubDriver::default();
        driver.states.insert(uuid(1), State::Initial);
        driver.states.insert(uuid(2), State::Stopped);
        let targets =
            BTreeMap::from([(uuid(1), State::Running), (uuid(2), State::Running)]);

        let mut controller = ForceTargetController::new();
        controller.manage(&targets, &mut driver).unwrap();

        assert_eq!(
            driver.set_calls,
            vec![
                (uuid(1), State::Initial, State::Running),
                (uuid(2), State::Stopped, State::Running),
            ]
        );
    }

    #[test]
    fn stopped_controller_aborts_the_pass() {
        let mut driver = StubDriver::default();
        driver.states.insert(uuid(1), State::Initial);
        let targets = BTreeMap::from([(uuid(1), State::Running)]);

        let mut controller = ForceTargetController::new();
        controller.stop(&mut driver);
        controller.manage(&targets, &mut driver).unwrap();
        assert!(driver.set_calls.is_empty());
    }

    #[test]
    fn panic_controller_escalates_failed() {
        let mut driver = StubDriver::default();
        driver.states.insert(uuid(1), State::Failed);
        driver.states.insert(uuid(2), State::Running);
        let targets =
            BTreeMap::from([(uuid(1), State::Running), (uuid(2), State::Running)]);

        let mut controller = PanicController::new();
        let err = controller.manage(&targets, &mut driver).unwrap_err();
        assert!(matches!(err, Error::StopHub { .. }));

        // fast stop drove everything toward stopped, best effort
        assert!(driver.set_calls.contains(&(uuid(1), State::Failed, State::Stopped)));
        assert!(driver.set_calls.contains(&(uuid(2), State::Running, State::Stopped)));
    }

    #[test]
    fn panic_controller_ignores_fast_stop_errors() {
        let mut driver = StubDriver::default();
        driver.states.insert(uuid(1), State::Numb);
        driver.fail_set_state = true;
        let targets = BTreeMap::from([(uuid(1), State::Running)]);

        let mut controller = PanicController::new();
        let err = controller.manage(&targets, &mut driver).unwrap_err();
        assert!(matches!(err, Error::StopHub { .. }));
    }

    #[test]
    fn panic_states_are_configurable() {
        let mut driver = StubDriver::default();
        driver.states.insert(uuid(1), State::Numb);
        let targets = BTreeMap::from([(uuid(1), State::Running)]);

        // numb excluded: delegate to the force-target path
        let mut controller = PanicController::with_panic_states([State::Failed]);
        controller.manage(&targets, &mut driver).unwrap();
        assert_eq!(driver.set_calls, vec![(uuid(1), State::Numb, State::Running)]);
    }
}
