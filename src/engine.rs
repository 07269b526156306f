//! Acquisition engine.
//!
//! One [`Engine`] runs at most one measurement session at a time on a
//! dedicated thread. The thread owns the transport and is the only writer of
//! the engine's [`OutputModel`]; the caller keeps a [`RunHandle`] to cancel
//! the run, follow its [`RunState`] and collect the [`RunReport`].
//!
//! # Session sequence
//!
//! ```text
//! Idle -> Configuring -> (Calibrating) -> Running -> Finalizing -> Finished
//!                    \__________\___________\___ Halting __/
//! ```
//!
//! Configuration sets the oscillator resolution and the sample count. A
//! right-channel sweep first sweeps the internal capacitor to derive a
//! reference-pulse threshold. Each repeat then either sweeps all 128 addresses
//! or reads the fixed reference address, once per active channel, and is
//! handed to the sink and then committed to the output model as a whole.
//!
//! # Cancellation
//!
//! [`RunHandle::halt`] raises a flag the session checks after every device
//! reply, while waiting for a read reply and while sleeping between repeats.
//! A repeat interrupted this way is discarded: it reaches neither the output
//! model nor the sink.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::cimos::Cimos;
use crate::config::{ConfigStore, EngineConfig, SweepAxis};
use crate::errors::{DriverError, ValidationError};
use crate::export::{CsvSink, NullSink, RepeatSink};
use crate::output::{OutputModel, RepeatResult};
use crate::params::{Mode, ParameterForm, ParameterSet};
use crate::protocol::{ChannelTag, MAX_ADDRESS};
use crate::transport::Transport;

/// Samples per read during the calibration sweep.
pub const CALIBRATION_SAMPLE_COUNT: u16 = 5;

/// Sweep indices whose means define the calibration line.
const CALIBRATION_INDICES: (usize, usize) = (15, 16);

/// Instrument characterisation constants for the reference pulse.
const REFERENCE_PULSE_GAIN: f64 = 402.7;
const REFERENCE_PULSE_OFFSET: f64 = 35.0;

/// Longest uninterrupted sleep between repeats.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

// ============================================================================
// Calibration
// ============================================================================

/// Line fitted through the internal-capacitor sweep and its derived threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub slope: f64,
    pub intercept: f64,
    pub reference_pulse: f64,
}

impl Calibration {
    pub fn from_line(slope: f64, intercept: f64) -> Self {
        Self {
            slope,
            intercept,
            reference_pulse: REFERENCE_PULSE_GAIN * slope + intercept + REFERENCE_PULSE_OFFSET,
        }
    }

    /// Fit through indices 15 and 16 of a sweep.
    pub fn from_sweep(means: &[i64], axis: &SweepAxis) -> Option<Self> {
        let (lo, hi) = CALIBRATION_INDICES;
        let (y_lo, y_hi) = (*means.get(lo)? as f64, *means.get(hi)? as f64);
        let (x_lo, x_hi) = (axis.label(lo), axis.label(hi));
        if x_hi == x_lo {
            return None;
        }
        let slope = (y_hi - y_lo) / (x_hi - x_lo);
        let intercept = y_hi - slope * x_hi;
        Some(Self::from_line(slope, intercept))
    }

    /// First sweep index whose value reaches the reference pulse.
    pub fn first_crossing(&self, values: &[i64]) -> Option<usize> {
        values
            .iter()
            .position(|&v| v as f64 >= self.reference_pulse)
    }
}

// ============================================================================
// Run state and results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed,
    Cancelled,
    Failed,
}

/// Observable phase of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Configuring,
    Calibrating,
    /// `repeat` is one-based.
    Running { repeat: u32, of: u32 },
    Halting,
    Finalizing,
    Finished(Termination),
}

impl RunState {
    /// True while a session thread is alive.
    pub fn is_active(&self) -> bool {
        !matches!(self, RunState::Idle | RunState::Finished(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished(_))
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    /// Stopped through the halt flag. Not an error.
    Cancelled,
    Failed(DriverError),
}

impl RunOutcome {
    pub fn termination(&self) -> Termination {
        match self {
            RunOutcome::Completed => Termination::Completed,
            RunOutcome::Cancelled => Termination::Cancelled,
            RunOutcome::Failed(_) => Termination::Failed,
        }
    }

    pub fn error(&self) -> Option<&DriverError> {
        match self {
            RunOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// What a finished session hands back.
pub struct RunReport {
    pub outcome: RunOutcome,
    pub repeats_completed: u32,
    pub calibration: Option<Calibration>,
    /// The transport, so it can be reused or closed by the caller.
    pub transport: Box<dyn Transport>,
}

impl fmt::Debug for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunReport")
            .field("outcome", &self.outcome)
            .field("repeats_completed", &self.repeats_completed)
            .field("calibration", &self.calibration)
            .field("transport", &self.transport.status())
            .finish()
    }
}

/// Why `start` refused to run. The transport is returned untouched.
pub struct Rejected {
    pub errors: Vec<ValidationError>,
    pub transport: Box<dyn Transport>,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "invalid parameters: {}", fields.join("; "))
    }
}

impl std::error::Error for Rejected {}

// ============================================================================
// Halt signal and run handle
// ============================================================================

/// Cooperative cancellation flag shared between a run and its controllers.
#[derive(Debug, Clone, Default)]
pub struct HaltSignal(Arc<AtomicBool>);

impl HaltSignal {
    /// Request cancellation. Idempotent, callable from any thread.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Publishes a state to the engine and to the run's own channel.
#[derive(Debug, Clone)]
struct StateLink {
    engine: Arc<watch::Sender<RunState>>,
    run: Arc<watch::Sender<RunState>>,
}

impl StateLink {
    fn publish(&self, state: RunState) {
        self.run.send_replace(state);
        self.engine.send_replace(state);
    }
}

/// Marks the run failed if the session thread unwinds before finishing.
struct PanicGuard(StateLink);

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("acquisition thread panicked");
            self.0.publish(RunState::Finished(Termination::Failed));
        }
    }
}

/// Controller side of one in-flight run. Its state follows this run only.
#[derive(Debug)]
pub struct RunHandle {
    halt: HaltSignal,
    state: watch::Receiver<RunState>,
    thread: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn halt(&self) {
        self.halt.set();
    }

    pub fn halt_signal(&self) -> HaltSignal {
        self.halt.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change of the run.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Resolve once the run has reached a terminal state.
    pub async fn finished(&mut self) -> RunState {
        if let Ok(state) = self.state.wait_for(RunState::is_terminal).await {
            return *state;
        }
        *self.state.borrow()
    }

    /// Block until the session thread exits.
    pub fn wait(self) -> RunReport {
        match self.thread.join() {
            Ok(report) => report,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    config: EngineConfig,
    store: Option<ConfigStore>,
    output: OutputModel,
    state: Arc<watch::Sender<RunState>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            config,
            store: None,
            output: OutputModel::new(),
            state: Arc::new(state),
        }
    }

    /// Persist each successful run's parameters to `store`.
    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle on the results of the current (or last) run.
    pub fn output(&self) -> OutputModel {
        self.output.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver that follows every run of this engine.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Last-used parameters of this device, or the built-in defaults.
    pub fn defaults(&self) -> crate::Result<ParameterSet> {
        match &self.store {
            Some(store) => Ok(store
                .load(&self.config.device_name)?
                .unwrap_or_default()),
            None => Ok(ParameterSet::default()),
        }
    }

    /// Clear the output model. Ignored while a run is in flight.
    pub fn reset(&self) {
        if self.is_running() {
            warn!("reset ignored while a run is active");
            return;
        }
        self.output.reset();
    }

    /// Parse a form and start a run with it.
    pub fn start_form(
        &self,
        form: &ParameterForm,
        transport: Box<dyn Transport>,
    ) -> Result<RunHandle, Rejected> {
        match form.parse() {
            Ok(params) => self.start(params, transport),
            Err(errors) => Err(Rejected { errors, transport }),
        }
    }

    /// Validate `params` and start a run, writing CSV if configured.
    pub fn start(
        &self,
        params: ParameterSet,
        transport: Box<dyn Transport>,
    ) -> Result<RunHandle, Rejected> {
        let sink: Box<dyn RepeatSink> = match &self.config.output_dir {
            Some(dir) => Box::new(CsvSink::new(dir, &self.config.device_name)),
            None => Box::new(NullSink),
        };
        self.start_with_sink(params, transport, sink)
    }

    /// Validate `params` and start a run that reports repeats to `sink`.
    ///
    /// No byte is sent when validation fails or another run is active.
    pub fn start_with_sink(
        &self,
        params: ParameterSet,
        transport: Box<dyn Transport>,
        sink: Box<dyn RepeatSink>,
    ) -> Result<RunHandle, Rejected> {
        if let Err(errors) = params.validate() {
            debug!("run rejected: errors={:?}", errors);
            return Err(Rejected { errors, transport });
        }

        let claimed = self.state.send_if_modified(|state| {
            if state.is_active() {
                false
            } else {
                *state = RunState::Configuring;
                true
            }
        });
        if !claimed {
            return Err(Rejected {
                errors: vec![ValidationError::new("run", "a run is already in progress")],
                transport,
            });
        }

        info!(
            "starting run: device={}, channel={}, mode={}, resolution={}, samples={}, repeats={}",
            self.config.device_name,
            params.channel,
            params.mode,
            params.resolution,
            params.sample_count,
            params.resolved_repeats()
        );

        self.output.reset();
        let halt = HaltSignal::default();
        let (run_state, run_rx) = watch::channel(RunState::Configuring);
        let link = StateLink {
            engine: Arc::clone(&self.state),
            run: Arc::new(run_state),
        };
        let guard = PanicGuard(link.clone());
        let session = Session {
            device: Cimos::new(transport).with_ready_timeout(self.config.ready_timeout),
            params,
            config: self.config.clone(),
            store: self.store.clone(),
            output: self.output.clone(),
            sink,
            halt: halt.clone(),
            state: link,
            repeats_completed: 0,
            calibration: None,
        };
        let thread = thread::spawn(move || {
            let _guard = guard;
            session.run()
        });

        Ok(RunHandle {
            halt,
            state: run_rx,
            thread,
        })
    }
}

// ============================================================================
// Session (runs on the acquisition thread)
// ============================================================================

/// Reasons the session loop unwinds early.
enum Interrupt {
    Halted,
    Fault(DriverError),
}

impl From<DriverError> for Interrupt {
    fn from(e: DriverError) -> Self {
        Interrupt::Fault(e)
    }
}

type Step<T> = std::result::Result<T, Interrupt>;

struct Session {
    device: Cimos,
    params: ParameterSet,
    config: EngineConfig,
    store: Option<ConfigStore>,
    output: OutputModel,
    sink: Box<dyn RepeatSink>,
    halt: HaltSignal,
    state: StateLink,
    repeats_completed: u32,
    calibration: Option<Calibration>,
}

impl Session {
    fn run(mut self) -> RunReport {
        let outcome = match self.acquire() {
            Ok(()) => RunOutcome::Completed,
            Err(Interrupt::Halted) => {
                self.set_state(RunState::Halting);
                info!(
                    "run halted: device={}, repeats_completed={}",
                    self.config.device_name, self.repeats_completed
                );
                self.device.interrupt();
                RunOutcome::Cancelled
            }
            Err(Interrupt::Fault(e)) => {
                error!(
                    "run failed: device={}, repeats_completed={}, error={}",
                    self.config.device_name, self.repeats_completed, e
                );
                RunOutcome::Failed(e)
            }
        };
        self.finalize(outcome)
    }

    fn acquire(&mut self) -> Step<()> {
        self.set_state(RunState::Configuring);
        self.configure()?;

        let tags = self.params.channel_tags();
        let repeats = self.params.resolved_repeats();

        if self.params.needs_calibration() {
            self.set_state(RunState::Calibrating);
            let calibration = self.calibrate()?;
            self.calibration = Some(calibration);
            self.output.reset();
        }

        let addresses: Vec<u8> = match self.params.mode {
            Mode::Sweep => (0..=MAX_ADDRESS).collect(),
            Mode::FixedReference => self.params.reference_value.into_iter().collect(),
        };

        for rep in 0..repeats {
            self.set_state(RunState::Running {
                repeat: rep + 1,
                of: repeats,
            });
            let started = Instant::now();

            let values = self.measure(&tags, &addresses)?;
            self.commit(&tags, values)?;
            self.repeats_completed += 1;

            if rep + 1 < repeats {
                let remaining = self.params.repeat_interval.saturating_sub(started.elapsed());
                self.pause(remaining)?;
            }
        }
        Ok(())
    }

    fn configure(&mut self) -> Step<()> {
        self.device.set_resolution(self.params.resolution)?;
        self.check_halt()?;
        self.device.set_sample_count(self.params.sample_count)?;
        self.check_halt()
    }

    /// Sweep the internal capacitor with a short sample count.
    fn calibrate(&mut self) -> Step<Calibration> {
        self.device.set_sample_count(CALIBRATION_SAMPLE_COUNT)?;
        self.check_halt()?;

        let addresses: Vec<u8> = (0..=MAX_ADDRESS).collect();
        let sweep = self
            .measure(&[ChannelTag::InternalCap], &addresses)?
            .pop()
            .unwrap_or_default();

        self.device.set_sample_count(self.params.sample_count)?;
        self.check_halt()?;

        let calibration =
            Calibration::from_sweep(&sweep, &self.config.sweep_axis).ok_or_else(|| {
                DriverError::Calibration(format!(
                    "cannot fit a line through sweep of {} points",
                    sweep.len()
                ))
            })?;
        info!(
            "calibration: slope={:.4}, intercept={:.4}, reference_pulse={:.4}",
            calibration.slope, calibration.intercept, calibration.reference_pulse
        );
        Ok(calibration)
    }

    /// Read every address on every tag; one vector of means per tag.
    fn measure(&mut self, tags: &[ChannelTag], addresses: &[u8]) -> Step<Vec<Vec<i64>>> {
        let mut values = vec![Vec::with_capacity(addresses.len()); tags.len()];
        for &address in addresses {
            for (slot, &tag) in values.iter_mut().zip(tags) {
                self.device.write_address(address, tag)?;
                self.check_halt()?;
                let mean = self
                    .device
                    .trigger_read(|| self.halt.is_set())?
                    .ok_or(Interrupt::Halted)?;
                self.check_halt()?;
                slot.push(mean);
            }
        }
        Ok(values)
    }

    /// Sink rows go out before the model sees the repeat, so a sink failure
    /// leaves the repeat out of both the model and the completed count.
    fn commit(&mut self, tags: &[ChannelTag], values: Vec<Vec<i64>>) -> Step<()> {
        let results: Vec<(ChannelTag, RepeatResult)> = tags
            .iter()
            .copied()
            .zip(values)
            .map(|(tag, v)| {
                let result = if self.params.mode == Mode::FixedReference && v.len() == 1 {
                    RepeatResult::Fixed(v[0])
                } else {
                    RepeatResult::Sweep(v)
                };
                (tag, result)
            })
            .collect();

        self.sink.begin_repeat(tags)?;
        for (tag, result) in &results {
            self.sink.write_repeat(*tag, result)?;
        }

        let points = results.first().map_or(0, |(_, r)| r.values().len());
        let channels = results.len();
        match &self.calibration {
            Some(calibration) => {
                let crossing = results
                    .iter()
                    .find(|(tag, _)| *tag == ChannelTag::Right)
                    .and_then(|(_, r)| calibration.first_crossing(r.values()));
                self.output.commit_with_crossing(results, crossing);
            }
            None => self.output.commit(results),
        }
        debug!(
            "repeat committed: repeat={}, channels={}, points={}",
            self.repeats_completed + 1,
            channels,
            points
        );
        Ok(())
    }

    fn pause(&self, remaining: Duration) -> Step<()> {
        let deadline = Instant::now() + remaining;
        loop {
            self.check_halt()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    fn check_halt(&self) -> Step<()> {
        if self.halt.is_set() {
            debug!("halt observed");
            Err(Interrupt::Halted)
        } else {
            Ok(())
        }
    }

    fn finalize(mut self, mut outcome: RunOutcome) -> RunReport {
        self.set_state(RunState::Finalizing);

        if let Err(e) = self.sink.finish() {
            error!("failed to close output files: error={}", e);
            if !matches!(outcome, RunOutcome::Failed(_)) {
                outcome = RunOutcome::Failed(e);
            }
        }

        if !matches!(outcome, RunOutcome::Failed(_)) {
            if let Some(store) = &self.store {
                if let Err(e) = store.save(&self.config.device_name, &self.params) {
                    warn!(
                        "failed to save parameters: device={}, error={}",
                        self.config.device_name, e
                    );
                }
            }
        }

        self.halt.clear();
        info!(
            "run finished: device={}, outcome={:?}, repeats_completed={}",
            self.config.device_name,
            outcome.termination(),
            self.repeats_completed
        );
        self.set_state(RunState::Finished(outcome.termination()));

        RunReport {
            outcome,
            repeats_completed: self.repeats_completed,
            calibration: self.calibration,
            transport: self.device.into_transport(),
        }
    }

    fn set_state(&self, state: RunState) {
        debug!("run state: {:?}", state);
        self.state.publish(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_pulse_from_line() {
        let c = Calibration::from_line(0.5, 10.0);
        assert!((c.reference_pulse - 246.35).abs() < 1e-9);
    }

    #[test]
    fn calibration_fits_indices_fifteen_and_sixteen() {
        let mut means = vec![0i64; 128];
        means[15] = 100;
        means[16] = 104;
        let c = Calibration::from_sweep(&means, &SweepAxis::default()).unwrap();
        assert_eq!(c.slope, 4.0);
        assert_eq!(c.intercept, 104.0 - 4.0 * 16.0);
        assert!((c.reference_pulse - (402.7 * 4.0 + 40.0 + 35.0)).abs() < 1e-9);
    }

    #[test]
    fn calibration_needs_enough_points_and_a_real_axis() {
        assert!(Calibration::from_sweep(&[1, 2, 3], &SweepAxis::default()).is_none());
        let flat = SweepAxis {
            offset: 1.0,
            step: 0.0,
        };
        assert!(Calibration::from_sweep(&[0; 128], &flat).is_none());
    }

    #[test]
    fn first_crossing_finds_threshold() {
        let c = Calibration::from_line(0.0, 15.0); // reference pulse 50
        assert_eq!(c.first_crossing(&[10, 49, 50, 80]), Some(2));
        assert_eq!(c.first_crossing(&[10, 20]), None);
    }

    #[test]
    fn state_classification() {
        assert!(!RunState::Idle.is_active());
        assert!(RunState::Running { repeat: 1, of: 2 }.is_active());
        assert!(RunState::Halting.is_active());
        assert!(RunState::Finished(Termination::Cancelled).is_terminal());
        assert!(!RunState::Finished(Termination::Failed).is_active());
    }
}
