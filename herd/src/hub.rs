//! Service hub.
//!
//! The hub holds the declared units, runs its controller on the soft-irq
//! cadence and orchestrates shutdown. It is itself a [`SoftIrq`]
//! service - its step is "run the controller once" - so it follows the
//! same loop/heartbeat discipline as any worker.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::controller::Controller;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::service::{SoftIrq, SoftIrqCtx, StepError};
use crate::signals::{self, SignalCell, SignalRole};
use crate::state::State;
use crate::unit::{ServiceFactory, Unit};

/// Registry of declared units plus the machinery that reconciles them.
pub struct Hub {
    ctx: SoftIrqCtx,
    units: BTreeMap<Uuid, Unit>,
    driver: Box<dyn Driver>,
    controller: Box<dyn Controller>,
    signal_cells: Vec<SignalCell>,
}

impl Hub {
    /// Build a hub around a driver and a controller. The context carries
    /// the loop cadence and the hub's own watchdog.
    pub fn new(
        driver: Box<dyn Driver>,
        controller: Box<dyn Controller>,
        mut ctx: SoftIrqCtx,
    ) -> Self {
        // the hub subscribes the supervisor disposition set
        ctx.options.role = SignalRole::Hub;
        Self { ctx, units: BTreeMap::new(), driver, controller, signal_cells: Vec::new() }
    }

    /// Declared target state of every unit.
    pub fn get_target_states(&self) -> BTreeMap<Uuid, State> {
        self.units.values().map(|unit| (unit.uuid(), unit.state())).collect()
    }

    /// Declare a unit and register its service with the driver.
    pub fn add_unit(&mut self, unit: Unit) -> Result<Unit> {
        if self.units.contains_key(&unit.uuid()) {
            return Err(Error::UnitExists { uuid: unit.uuid() });
        }
        self.driver.validate_target_state(unit.state())?;
        self.driver.add_service(unit.uuid(), unit.factory())?;
        tracing::info!(unit = ?unit, "unit added");
        self.units.insert(unit.uuid(), unit.clone());
        Ok(unit)
    }

    /// Update a declared unit. Only the target state may change; a unit
    /// carrying a different factory is rejected.
    pub fn update_unit(&mut self, unit: &Unit) -> Result<()> {
        let existing = self
            .units
            .get_mut(&unit.uuid())
            .ok_or(Error::UnitNotFound { uuid: unit.uuid() })?;
        self.driver.validate_target_state(unit.state())?;
        if !existing.same_factory(unit) {
            return Err(Error::UnitMismatch { uuid: unit.uuid() });
        }
        let old = existing.state();
        existing.set_state(unit.state());
        tracing::info!(uuid = %unit.uuid(), %old, new = %unit.state(), "unit updated");
        Ok(())
    }

    /// Remove a unit: its worker is stopped and joined first.
    pub fn remove_unit(&mut self, unit: &Unit) -> Result<()> {
        if !self.units.contains_key(&unit.uuid()) {
            return Err(Error::UnitNotFound { uuid: unit.uuid() });
        }
        self.driver.remove_service(unit.uuid())?;
        self.units.remove(&unit.uuid());
        tracing::info!(uuid = %unit.uuid(), "unit removed");
        Ok(())
    }

    /// Declare a service. Wrapper over [`add_unit`](Hub::add_unit);
    /// `state` is typically [`State::Running`].
    pub fn add_service(&mut self, factory: ServiceFactory, state: State) -> Result<Unit> {
        self.add_unit(Unit::new(factory, state))
    }

    /// Allocate a signal mailbox for a worker. Pending SIGHUP/SIGUSR1
    /// received by the hub process are forwarded into every allocated
    /// cell.
    pub fn signal_cell(&mut self) -> herd_shm::ShmResult<SignalCell> {
        let cell = SignalCell::new()?;
        self.signal_cells.push(cell.clone());
        Ok(cell)
    }

    /// Access the driver, e.g. for state inspection.
    pub fn driver_mut(&mut self) -> &mut dyn Driver {
        self.driver.as_mut()
    }

    /// Drain an OS-level SIGHUP/SIGUSR1, handle it locally and forward
    /// it to the workers through their signal cells.
    fn forward_pending_signal(&mut self) {
        let signum = signals::take_forward_signal();
        if signum == 0 {
            return;
        }
        tracing::info!(signum, "forwarding signal to workers");
        match signum {
            libc::SIGHUP => self.on_sighup(),
            libc::SIGUSR1 => self.on_sigusr1(),
            _ => {}
        }
        for cell in &self.signal_cells {
            cell.post(signum);
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("shutting down: stopping all services");
        self.driver.stop_all_services();
        tracing::info!("waiting for all services");
        self.driver.wait_all_services();
    }
}

impl SoftIrq for Hub {
    fn ctx(&self) -> &SoftIrqCtx {
        &self.ctx
    }

    fn ctx_mut(&mut self) -> &mut SoftIrqCtx {
        &mut self.ctx
    }

    fn service_name(&self) -> &str {
        "hub"
    }

    /// One reconciliation pass. `StopHub` stops the hub cleanly; any
    /// other controller error stops it and resurfaces from `serve`.
    fn step(&mut self) -> std::result::Result<(), StepError> {
        self.forward_pending_signal();
        tracing::debug!("managing state");
        let targets = self.get_target_states();
        match self.controller.manage(&targets, self.driver.as_mut()) {
            Ok(()) => Ok(()),
            Err(Error::StopHub { reason }) => {
                tracing::info!(%reason, "stop hub requested");
                self.stop();
                Ok(())
            }
            Err(err) => {
                self.stop();
                Err(Box::new(err))
            }
        }
    }

    fn stop(&mut self) {
        tracing::info!("stopping hub");
        self.controller.stop(self.driver.as_mut());
        self.ctx.request_stop();
    }

    /// A controller failure is re-raised from `serve` for visibility;
    /// the operator binary exits non-zero on it.
    fn capture_fatal(&mut self, _err: &StepError) -> bool {
        true
    }

    fn on_teardown(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::controller::ForceTargetController;
    use crate::service::SoftIrqOptions;
    use crate::test_support::{StubDriver, noop_factory};
    use crate::watchdog::NoopWatchdog;

    fn hub_with(controller: Box<dyn Controller>) -> Hub {
        let options = SoftIrqOptions { subscribe_signals: false, ..Default::default() };
        Hub::new(
            Box::new(StubDriver::default()),
            controller,
            SoftIrqCtx::new(options, Box::new(NoopWatchdog::new())),
        )
    }

    fn hub() -> Hub {
        hub_with(Box::new(ForceTargetController::new()))
    }

    #[test]
    fn add_unit_registers_with_the_driver() {
        let mut hub = hub();
        let unit = hub.add_service(noop_factory(), State::Running).unwrap();
        assert_eq!(hub.get_target_states()[&unit.uuid()], State::Running);
        assert_eq!(hub.driver_mut().get_states()[&unit.uuid()], State::Initial);
    }

    #[test]
    fn duplicate_unit_is_rejected() {
        let mut hub = hub();
        let unit = hub.add_service(noop_factory(), State::Running).unwrap();
        let err = hub.add_unit(unit).unwrap_err();
        assert!(matches!(err, Error::UnitExists { .. }));
    }

    #[test]
    fn add_unit_validates_the_target_state() {
        let mut hub = hub();
        let err = hub.add_service(noop_factory(), State::Failed).unwrap_err();
        assert!(matches!(err, Error::DriverUnsupportedState { state: State::Failed }));
        assert!(hub.get_target_states().is_empty());
    }

    #[test]
    fn update_unit_changes_state_only() {
        let mut hub = hub();
        let mut unit = hub.add_service(noop_factory(), State::Running).unwrap();
        unit.set_state(State::Stopped);
        hub.update_unit(&unit).unwrap();
        assert_eq!(hub.get_target_states()[&unit.uuid()], State::Stopped);
    }

    #[test]
    fn update_unit_rejects_a_different_factory() {
        let mut hub = hub();
        let unit = hub.add_service(noop_factory(), State::Running).unwrap();
        let imposter = Unit::with_uuid(unit.uuid(), noop_factory(), State::Stopped);
        let err = hub.update_unit(&imposter).unwrap_err();
        assert!(matches!(err, Error::UnitMismatch { .. }));
        assert_eq!(hub.get_target_states()[&unit.uuid()], State::Running);
    }

    #[test]
    fn update_unknown_unit_errors() {
        let mut hub = hub();
        let unit = Unit::new(noop_factory(), State::Running);
        assert!(matches!(hub.update_unit(&unit), Err(Error::UnitNotFound { .. })));
    }

    #[test]
    fn remove_unit_leaves_both_maps_empty() {
        let mut hub = hub();
        let unit = hub.add_service(noop_factory(), State::Running).unwrap();
        hub.remove_unit(&unit).unwrap();
        assert!(hub.get_target_states().is_empty());
        assert!(hub.driver_mut().get_states().is_empty());
        assert!(matches!(hub.remove_unit(&unit), Err(Error::UnitNotFound { .. })));
    }

    #[test]
    fn step_reconciles_toward_targets() {
        let mut hub = hub();
        let unit = hub.add_service(noop_factory(), State::Running).unwrap();
        SoftIrq::step(&mut hub).unwrap();
        assert_eq!(hub.driver_mut().get_states()[&unit.uuid()], State::Running);
    }

    #[test]
    fn stop_hub_from_the_controller_is_a_clean_stop() {
        struct StopOnce;
        impl Controller for StopOnce {
            fn manage(
                &mut self,
                _targets: &BTreeMap<Uuid, State>,
                _driver: &mut dyn Driver,
            ) -> Result<()> {
                Err(Error::StopHub { reason: "test".into() })
            }
            fn stop(&mut self, _driver: &mut dyn Driver) {}
        }

        let mut hub = hub_with(Box::new(StopOnce));
        hub.ctx_mut().running = true;
        SoftIrq::step(&mut hub).unwrap();
        assert!(!hub.ctx().is_running());
    }

    #[test]
    fn controller_errors_stop_the_hub_and_resurface() {
        struct Broken;
        impl Controller for Broken {
            fn manage(
                &mut self,
                _targets: &BTreeMap<Uuid, State>,
                _driver: &mut dyn Driver,
            ) -> Result<()> {
                Err(Error::UnitNotFound { uuid: Uuid::nil() })
            }
            fn stop(&mut self, _driver: &mut dyn Driver) {}
        }

        let mut hub = hub_with(Box::new(Broken));
        hub.ctx_mut().running = true;
        let err = SoftIrq::step(&mut hub).unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(!hub.ctx().is_running());
    }

    #[test]
    #[serial]
    fn controller_errors_resurface_from_serve() {
        struct Broken;
        impl Controller for Broken {
            fn manage(
                &mut self,
                _targets: &BTreeMap<Uuid, State>,
                _driver: &mut dyn Driver,
            ) -> Result<()> {
                Err(Error::UnitNotFound { uuid: Uuid::nil() })
            }
            fn stop(&mut self, _driver: &mut dyn Driver) {}
        }

        // unlike a worker, the hub re-raises the error after teardown
        let mut hub = hub_with(Box::new(Broken));
        let err = SoftIrq::serve(&mut hub).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn teardown_stops_and_waits_for_all_services() {
        let driver = StubDriver::default();
        let stopped = driver.stopped_all.clone();
        let waited = driver.waited_all.clone();
        let options = SoftIrqOptions { subscribe_signals: false, ..Default::default() };
        let mut hub = Hub::new(
            Box::new(driver),
            Box::new(ForceTargetController::new()),
            SoftIrqCtx::new(options, Box::new(NoopWatchdog::new())),
        );
        hub.on_teardown();
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
        assert!(waited.load(std::sync::atomic::Ordering::SeqCst));
    }
}
