//! Step observation events.
//!
//! Every loop iteration emits a step event through the configured
//! sender; failed steps and watchdog failures add their own events.
//! Payloads are serializable so senders can ship them to whatever
//! pipeline the operator wires up.

use serde::Serialize;
use uuid::Uuid;

/// Measured facts about one loop iteration.
#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    pub iteration: u64,
    pub service: String,
    pub step_period_secs: f64,
    pub pid: Option<u32>,
    pub launch_id: Option<Uuid>,
    /// Wall-clock step start, UNIX microseconds.
    pub start_us: Option<u64>,
    /// Wall-clock step end, UNIX microseconds.
    pub end_us: Option<u64>,
    pub duration_us: Option<u64>,
    /// True when the watchdog refused the step before it ran.
    pub skipped: bool,
}

/// Event emitted by the soft-irq loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepEvent {
    /// Per-iteration report; `tb` mirrors whether the step failed.
    Step {
        event_type: String,
        #[serde(flatten)]
        info: StepInfo,
        tb: bool,
    },
    /// The user step raised an error.
    StepError {
        event_type: String,
        #[serde(flatten)]
        info: StepInfo,
        error: String,
    },
    /// The watchdog raised within the iteration.
    WatchdogError {
        event_type: String,
        #[serde(flatten)]
        info: StepInfo,
        minor: bool,
        error: String,
    },
}

/// Sink for loop events: a metrics pipeline, a message bus, or a test
/// capture buffer.
pub trait EventSender: Send {
    fn send_event(&self, event: StepEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StepInfo {
        StepInfo {
            iteration: 3,
            service: "worker".into(),
            step_period_secs: 1.0,
            pid: Some(42),
            launch_id: None,
            start_us: Some(1_000),
            end_us: Some(2_500),
            duration_us: Some(1_500),
            skipped: false,
        }
    }

    #[test]
    fn step_event_serializes_flat() {
        let event = StepEvent::Step {
            event_type: "worker.service.soft_irq.iteration_step".into(),
            info: info(),
            tb: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "step");
        assert_eq!(value["iteration"], 3);
        assert_eq!(value["tb"], false);
        assert_eq!(value["event_type"], "worker.service.soft_irq.iteration_step");
    }

    #[test]
    fn watchdog_event_carries_severity() {
        let event = StepEvent::WatchdogError {
            event_type: "worker.service.soft_irq.iteration_step.watchdog_context_error".into(),
            info: info(),
            minor: true,
            error: "lock busy".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "watchdog_error");
        assert_eq!(value["minor"], true);
        assert_eq!(value["error"], "lock busy");
    }
}
