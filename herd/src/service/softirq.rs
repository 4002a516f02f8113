//! Soft-IRQ service loop.
//!
//! The generic main loop a worker runs inside its child process: a
//! periodic `step` bracketed by the watchdog, with signal-aware pacing,
//! cross-process signal dispatch and per-iteration events.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::logging;
use crate::service::StepError;
use crate::service::events::{EventSender, StepEvent, StepInfo};
use crate::signals::{self, SignalCell, SignalRole};
use crate::watchdog::{Watchdog, WatchdogError};

fn unix_micros(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

/// Construction options for a [`SoftIrqCtx`].
pub struct SoftIrqOptions {
    /// Minimal period between step starts.
    pub step_period: Duration,
    /// Pause between loop passes; zero sleeps precisely until the next
    /// step is due.
    pub loop_period: Duration,
    /// When false the service only parks and waits for a stop signal: no
    /// work is performed and no heartbeat is generated. A timed watchdog
    /// attached to a non-operating service will therefore read numb.
    pub operate: bool,
    /// Whether `serve` installs the process signal dispositions.
    pub subscribe_signals: bool,
    /// Disposition set installed when subscribing.
    pub role: SignalRole,
    /// Override for the step event type.
    pub event_type: Option<String>,
    /// Override for the step-error event type.
    pub error_event_type: Option<String>,
}

impl Default for SoftIrqOptions {
    fn default() -> Self {
        Self {
            step_period: Duration::from_secs(1),
            loop_period: Duration::from_millis(100),
            operate: true,
            subscribe_signals: true,
            role: SignalRole::Worker,
            event_type: None,
            error_event_type: None,
        }
    }
}

/// State shared by every soft-irq service: pacing, watchdog, event
/// sender, signal cell and per-launch identity.
pub struct SoftIrqCtx {
    pub watchdog: Box<dyn Watchdog>,
    pub(crate) options: SoftIrqOptions,
    pub(crate) sender: Option<Box<dyn EventSender>>,
    pub(crate) signal_cell: Option<SignalCell>,
    pub(crate) running: bool,
    pub(crate) sig_subscribed: bool,
    pub(crate) next_step_delta: Option<Duration>,
    pub(crate) launch_id: Option<Uuid>,
    pub(crate) pid: Option<u32>,
    pub(crate) iteration: u64,
    pub(crate) fatal: Option<StepError>,
}

impl SoftIrqCtx {
    pub fn new(options: SoftIrqOptions, watchdog: Box<dyn Watchdog>) -> Self {
        Self {
            watchdog,
            options,
            sender: None,
            signal_cell: None,
            running: false,
            sig_subscribed: false,
            next_step_delta: None,
            launch_id: None,
            pid: None,
            iteration: 0,
            fatal: None,
        }
    }

    /// Attach an event sender for step reports.
    pub fn set_sender(&mut self, sender: Box<dyn EventSender>) {
        self.sender = Some(sender);
    }

    /// Attach the fork-shared cell the supervisor forwards signals into.
    pub fn set_signal_cell(&mut self, cell: SignalCell) {
        self.signal_cell = Some(cell);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn launch_id(&self) -> Option<Uuid> {
        self.launch_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Stop the loop after the current pass.
    pub fn request_stop(&mut self) {
        self.running = false;
    }
}

#[cfg(target_os = "linux")]
fn set_pdeathsig() {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    if let Err(err) = prctl::set_pdeathsig(Signal::SIGKILL) {
        tracing::warn!(error = %err, "failed to set parent-death signal");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_pdeathsig() {}

/// The soft-IRQ service: a periodic `step` with heartbeat, signal
/// handling and measured events.
///
/// Implementors provide [`step`](SoftIrq::step) and the context
/// accessors; the loop itself, the watchdog protocol and the event
/// emission are provided methods. The blanket [`Service`] impl makes
/// every soft-irq service runnable by the process driver.
///
/// [`Service`]: crate::service::Service
pub trait SoftIrq: Send {
    fn ctx(&self) -> &SoftIrqCtx;
    fn ctx_mut(&mut self) -> &mut SoftIrqCtx;

    /// One unit of work.
    fn step(&mut self) -> Result<(), StepError>;

    /// Name used in event payloads and log lines.
    fn service_name(&self) -> &str {
        "soft_irq"
    }

    /// Hook run once per launch after the generic setup.
    fn on_setup(&mut self) {}

    /// Hook run on teardown, before the watchdog is torn down.
    fn on_teardown(&mut self) {}

    /// Reaction to a forwarded SIGHUP.
    fn on_sighup(&mut self) {}

    /// Reaction to a forwarded SIGUSR1: toggle the root log level.
    fn on_sigusr1(&mut self) {
        logging::toggle_debug();
    }

    /// Whether a step error should abort serving and resurface from
    /// [`serve`](SoftIrq::serve). Workers contain step errors and keep
    /// iterating; the hub overrides this so a controller failure exits
    /// the supervisor visibly.
    fn capture_fatal(&mut self, _err: &StepError) -> bool {
        false
    }

    /// Ask the loop to stop after the current pass.
    fn stop(&mut self) {
        tracing::info!(service = self.service_name(), "stopping");
        self.ctx_mut().request_stop();
    }

    /// Reschedule the next step to `delta` from now, one-shot.
    fn schedule_next_step(&mut self, delta: Duration) {
        tracing::info!(delta_s = delta.as_secs_f64(), "rescheduling next step");
        self.ctx_mut().next_step_delta = Some(delta);
    }

    /// Run the service until stopped. Returns the fatal error, if the
    /// loop was stopped by one, after teardown has completed.
    fn serve(&mut self) -> Result<(), StepError> {
        signals::reset();
        if !self.ctx().options.operate {
            return self.serve_fake();
        }

        tracing::info!(service = self.service_name(), "preparing to serve");
        self.setup();

        let mut serve_error: Option<StepError> = None;
        if self.ctx().options.subscribe_signals && !self.ctx().sig_subscribed {
            match signals::subscribe(self.ctx().options.role) {
                Ok(()) => self.ctx_mut().sig_subscribed = true,
                Err(err) => serve_error = Some(Box::new(err)),
            }
        }

        if serve_error.is_none() {
            tracing::info!(service = self.service_name(), "serving");
            self.run_loop();
            tracing::info!(service = self.service_name(), "finished serving");
        }

        tracing::info!(service = self.service_name(), "tearing down");
        self.on_teardown();
        let ctx = self.ctx_mut();
        ctx.watchdog.teardown();
        ctx.launch_id = None;
        ctx.pid = None;
        tracing::info!(service = self.service_name(), "service has been stopped");

        if let Some(err) = serve_error {
            return Err(err);
        }
        match self.ctx_mut().fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Non-operating serve: install stop handlers and park. No work, no
    /// heartbeat.
    fn serve_fake(&mut self) -> Result<(), StepError> {
        tracing::info!(
            service = self.service_name(),
            "serving is not started, operate is not enabled"
        );
        if self.ctx().options.subscribe_signals {
            if let Err(err) = signals::subscribe_stop_only() {
                return Err(Box::new(err));
            }
        }
        while !signals::stop_requested() {
            unsafe { libc::pause() };
        }
        Ok(())
    }

    /// The pacing loop around [`loop_step`](SoftIrq::loop_step).
    fn run_loop(&mut self) {
        self.ctx_mut().running = true;
        let step_period = self.ctx().options.step_period;
        let loop_period = self.ctx().options.loop_period;
        let mut next_step = Instant::now();

        while self.ctx().running && !signals::stop_requested() {
            let now = Instant::now();
            if now >= next_step {
                next_step = now + step_period;
                self.loop_step();
            }

            if let Some(delta) = self.ctx_mut().next_step_delta.take() {
                next_step = Instant::now() + delta;
            }

            if loop_period.is_zero() {
                // wait for the next step efficiently
                let now = Instant::now();
                if next_step > now {
                    std::thread::sleep(next_step - now);
                }
            } else {
                std::thread::sleep(loop_period);
            }
        }
    }

    /// One iteration: drain the signal cell, run the step inside the
    /// watchdog bracket, settle the heartbeat and emit events.
    ///
    /// Minor watchdog errors skip the step but still heartbeat; critical
    /// ones withhold the heartbeat so the supervisor observes numb. Step
    /// errors are contained: logged, reported, no heartbeat, loop goes
    /// on.
    fn loop_step(&mut self) {
        self.dispatch_signal_cell();

        let iteration = self.ctx().iteration;
        tracing::debug!(iteration, "starting iteration");

        let mut info = self.make_step_info();
        let start = SystemTime::now();
        let started = Instant::now();

        let mut wd_error: Option<WatchdogError> = None;
        let mut step_error: Option<StepError> = None;

        match self.ctx_mut().watchdog.enter() {
            Ok(()) => {
                info.skipped = false;
                let result = self.step();
                self.ctx_mut().watchdog.exit();
                match result {
                    Ok(()) => {
                        // post-step heartbeat failures are never raised
                        if let Err(err) = self.ctx_mut().watchdog.generate_heartbeat() {
                            tracing::warn!(iteration, error = %err, "post-step heartbeat failed");
                        }
                    }
                    Err(err) => step_error = Some(err),
                }
            }
            Err(err) => wd_error = Some(err),
        }

        let end = SystemTime::now();
        info.start_us = Some(unix_micros(start));
        info.end_us = Some(unix_micros(end));
        info.duration_us = Some(started.elapsed().as_micros() as u64);

        match (&wd_error, &step_error) {
            (Some(err), _) if err.is_minor() => {
                tracing::debug!(iteration, error = %err, "ignoring minor watchdog error");
                if let Err(hb) = self.ctx_mut().watchdog.generate_heartbeat() {
                    tracing::warn!(iteration, error = %hb, "heartbeat after minor watchdog error failed");
                }
            }
            (Some(err), _) => {
                tracing::error!(iteration, error = %err, "watchdog error within iteration");
            }
            (None, Some(err)) => {
                tracing::error!(iteration, error = %err, "step error during iteration");
            }
            (None, None) => {
                tracing::debug!(
                    iteration,
                    duration_s = started.elapsed().as_secs_f64(),
                    "finished iteration"
                );
            }
        }

        self.send_step_events(&info, &wd_error, &step_error);

        if let Some(err) = step_error {
            if self.capture_fatal(&err) && self.ctx().fatal.is_none() {
                self.ctx_mut().fatal = Some(err);
            }
        }

        self.ctx_mut().iteration += 1;
    }

    /// Drain the cross-process signal cell and dispatch.
    fn dispatch_signal_cell(&mut self) {
        let Some(cell) = self.ctx().signal_cell.clone() else {
            return;
        };
        let signum = cell.take();
        if signum == 0 {
            return;
        }
        tracing::info!(signum, "dispatching cross-process signal");
        match signum {
            libc::SIGHUP => self.on_sighup(),
            libc::SIGUSR1 => self.on_sigusr1(),
            _ => tracing::debug!(signum, "no handler for cross-process signal"),
        }
    }

    fn make_step_info(&self) -> StepInfo {
        let ctx = self.ctx();
        StepInfo {
            iteration: ctx.iteration,
            service: self.service_name().to_string(),
            step_period_secs: ctx.options.step_period.as_secs_f64(),
            pid: ctx.pid,
            launch_id: ctx.launch_id,
            start_us: None,
            end_us: None,
            duration_us: None,
            skipped: true,
        }
    }

    fn step_event_type(&self) -> String {
        self.ctx().options.event_type.clone().unwrap_or_else(|| {
            format!("{}.service.soft_irq.iteration_step", self.service_name())
        })
    }

    fn error_event_type(&self) -> String {
        self.ctx()
            .options
            .error_event_type
            .clone()
            .unwrap_or_else(|| format!("{}.error", self.step_event_type()))
    }

    fn watchdog_event_type(&self) -> String {
        format!("{}.watchdog_context_error", self.step_event_type())
    }

    fn send_step_events(
        &self,
        info: &StepInfo,
        wd_error: &Option<WatchdogError>,
        step_error: &Option<StepError>,
    ) {
        let Some(sender) = &self.ctx().sender else {
            tracing::debug!("no sender, skipping step events");
            return;
        };
        sender.send_event(StepEvent::Step {
            event_type: self.step_event_type(),
            info: info.clone(),
            tb: step_error.is_some(),
        });
        if let Some(err) = step_error {
            sender.send_event(StepEvent::StepError {
                event_type: self.error_event_type(),
                info: info.clone(),
                error: err.to_string(),
            });
        }
        if let Some(err) = wd_error {
            sender.send_event(StepEvent::WatchdogError {
                event_type: self.watchdog_event_type(),
                info: info.clone(),
                minor: err.is_minor(),
                error: err.to_string(),
            });
        }
    }

    /// Per-launch init: fresh launch id, pid, parent-death signal.
    fn setup(&mut self) {
        let ctx = self.ctx_mut();
        ctx.launch_id = Some(Uuid::new_v4());
        ctx.pid = Some(std::process::id());
        set_pdeathsig();
        self.on_setup();
    }
}
