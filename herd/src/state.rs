//! Worker lifecycle states.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a worker service.
///
/// Only `Running` and `Stopped` are valid *target* states; the rest are
/// observation-only. An unstarted process reads `Initial` and never
/// reads `Initial` again once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Process record exists but was never started.
    Initial,
    /// Process is alive and, if a watchdog applies, its heartbeat is fresh.
    Running,
    /// Process is not alive and the last exit was clean (exit 0 or
    /// terminated by SIGTERM), or the supervisor explicitly marked it
    /// stopped.
    Stopped,
    /// Process is not alive and the last exit was abnormal.
    Failed,
    /// Process is alive but its watchdog went stale.
    Numb,
}

impl State {
    /// Lowercase name, stable for logging and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Initial => "initial",
            State::Running => "running",
            State::Stopped => "stopped",
            State::Failed => "failed",
            State::Numb => "numb",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase() {
        assert_eq!(State::Initial.to_string(), "initial");
        assert_eq!(State::Numb.to_string(), "numb");
    }

    #[test]
    fn states_order_deterministically() {
        let mut states = [State::Numb, State::Initial, State::Stopped];
        states.sort();
        assert_eq!(states, [State::Initial, State::Stopped, State::Numb]);
    }
}
