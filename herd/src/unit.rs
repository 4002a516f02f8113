//! Declared-desired unit records.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::service::Service;
use crate::state::State;

/// Constructor for a worker service instance.
///
/// Invoked once per (re)initialization. Every invocation must produce a
/// fresh service whose watchdog cells are newly allocated, so they can
/// be inherited by the next fork.
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// The declared-desired record for one worker: a stable identity, a
/// service factory and a target state.
///
/// The factory is immutable after registration; only the target state
/// changes. Identity is by uuid, assigned at creation when not supplied.
#[derive(Clone)]
pub struct Unit {
    uuid: Uuid,
    factory: ServiceFactory,
    state: State,
}

impl Unit {
    /// Declare a unit with a freshly assigned uuid.
    pub fn new(factory: ServiceFactory, state: State) -> Self {
        Self::with_uuid(Uuid::new_v4(), factory, state)
    }

    /// Declare a unit with a caller-chosen uuid.
    pub fn with_uuid(uuid: Uuid, factory: ServiceFactory, state: State) -> Self {
        Self { uuid, factory, state }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn factory(&self) -> ServiceFactory {
        Arc::clone(&self.factory)
    }

    /// Declared target state.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    /// Whether two units share the same factory. Closures have no
    /// structural equality; identity of the `Arc` is the contract.
    pub fn same_factory(&self, other: &Unit) -> bool {
        Arc::ptr_eq(&self.factory, &other.factory)
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("uuid", &self.uuid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
