//! Worker materialization drivers.

mod process;

pub use process::ProcessDriver;

use std::collections::BTreeMap;
use std::time::Duration;

use uuid::Uuid;

use crate::error::Result;
use crate::state::State;
use crate::unit::ServiceFactory;

/// Materializes declared units as workers and reports observed state.
///
/// Keyed by unit uuid throughout; `get_states` returns a `BTreeMap`, so
/// controllers visit units in a deterministic order.
pub trait Driver: Send {
    /// Fails with `DriverUnsupportedState` unless `state` is a valid
    /// target for this driver.
    fn validate_target_state(&self, state: State) -> Result<()>;

    /// Observed state of every known service.
    fn get_states(&mut self) -> BTreeMap<Uuid, State>;

    /// Drive `uuid` from `old` toward `new`. An identical pair collapses
    /// to a no-op before dispatch.
    fn set_state(&mut self, uuid: Uuid, old: State, new: State) -> Result<()>;

    /// Register a service; fails with `ServiceExists` on duplicates.
    fn add_service(&mut self, uuid: Uuid, factory: ServiceFactory) -> Result<()>;

    /// Stop, join (unbounded) and forget a service.
    fn remove_service(&mut self, uuid: Uuid) -> Result<()>;

    /// Ask one service to stop.
    fn stop_service(&mut self, uuid: Uuid) -> Result<()>;

    /// Ask every service to stop (best effort).
    fn stop_all_services(&mut self);

    /// Join one service. `None` waits forever; an elapsed `Some` fails
    /// with `ServiceWaitTimeout`.
    fn wait_service(&mut self, uuid: Uuid, timeout: Option<Duration>) -> Result<()>;

    /// Join every service, without bound.
    fn wait_all_services(&mut self);
}
