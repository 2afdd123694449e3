//! Sequence Engine
//!
//! Plays one sequence at a time on a virtual clock.
//!
//! # Run States
//!
//! ```text
//!          start            pause
//!   Idle ────────► Running ───────► Paused
//!                   │   ▲   resume   │  │ step
//!                   │   └────────────┘  └──► (fires next offset group)
//!      last step ───┤                   │
//!                   ▼        stop       ▼
//!               Completed    ────►   Stopped
//! ```
//!
//! A `start` while a run is active supersedes it: the old run ends with a
//! `Superseded` notice and issues nothing further.
//!
//! # Locking
//!
//! Two locks, always taken in this order:
//!
//! - `sequencer`: held for a whole tick or control call, including the HAL
//!   calls it issues, so calls of a superseded run can never interleave with
//!   the run that replaced it.
//! - `state`: held only while deciding which calls to issue. [`status`]
//!   takes only this lock and never waits on hardware.
//!
//! [`status`]: SequenceEngine::status

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{EngineError, Position, Sequence, SequenceLibrary, SequenceRef, SequenceStep};
use crate::hal::{mirror_pulse, Hal, HalCall, HalError, ServoPositions};

/// Buffered notices per subscriber before the oldest is dropped
const NOTICE_CAPACITY: usize = 64;

/// Lifecycle state of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run has been started
    Idle,
    /// Advancing with the clock
    Running,
    /// Clock frozen for this run
    Paused,
    /// Last step fired
    Completed,
    /// Ended by stop or supersession
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Control action on the active run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAction {
    /// Freeze the run
    Pause,
    /// Continue a paused run
    Resume,
    /// Fire the next offset group of a paused run
    Step,
    /// End the run
    Stop,
}

impl fmt::Display for RunAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Step => "step",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Why a run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Every step fired
    Completed,
    /// Explicit stop
    Stopped,
    /// Replaced by a newer start
    Superseded,
}

/// Broadcast when a run ends
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionNotice {
    /// Run identifier, unique per engine
    pub run_id: u64,
    /// Sequence id
    pub sequence_id: u8,
    /// Sequence name
    pub sequence_name: String,
    /// Why the run ended
    pub reason: CompletionReason,
    /// Virtual time the run spent running (pauses excluded)
    pub elapsed_ms: u64,
    /// Steps fired
    pub steps_fired: usize,
    /// Steps in the sequence
    pub total_steps: usize,
}

/// Snapshot of a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Run identifier
    pub run_id: u64,
    /// Sequence id
    pub sequence_id: u8,
    /// Sequence name
    pub sequence_name: String,
    /// Current state
    pub state: RunState,
    /// Index of the next step to fire
    pub current_step_index: usize,
    /// Steps in the sequence
    pub total_steps: usize,
    /// Engine clock when the run started
    pub started_at_ms: u64,
    /// Virtual time the run has been running
    pub elapsed_ms: u64,
}

/// Snapshot of the engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Engine virtual clock
    pub now_ms: u64,
    /// Active run, or the last one that ended
    pub run: Option<RunStatus>,
}

impl EngineStatus {
    /// State of the active or last run (`Idle` if none)
    #[must_use]
    pub fn state(&self) -> RunState {
        self.run.as_ref().map_or(RunState::Idle, |r| r.state)
    }
}

/// Outcome of one tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// HAL calls issued
    pub calls: Vec<HalCall>,
    /// HAL calls that failed
    pub failures: Vec<HalError>,
    /// Notice if the run completed on this tick
    pub completed: Option<CompletionNotice>,
}

// ============================================================================
// Internal state
// ============================================================================

/// What a fired step tells one servo channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Output {
    Pulse(u16),
    Released,
}

impl Output {
    fn to_call(self, channel: u8) -> HalCall {
        match self {
            Self::Pulse(pulse_us) => HalCall::ServoSetPosition { channel, pulse_us },
            Self::Released => HalCall::ServoRelease { channel },
        }
    }
}

fn is_reversed(directions: u16, channel: u8) -> bool {
    (1..=16).contains(&channel) && directions & (1 << (channel - 1)) != 0
}

fn output_for(position: Position, channel: u8, directions: u16) -> Output {
    match position.pulse_us() {
        Some(us) if is_reversed(directions, channel) => Output::Pulse(mirror_pulse(us)),
        Some(us) => Output::Pulse(us),
        None => Output::Released,
    }
}

#[derive(Debug)]
struct ActiveRun {
    run_id: u64,
    sequence: Arc<Sequence>,
    state: RunState,
    started_at_ms: u64,
    elapsed_ms: u64,
    next_step: usize,
    /// Positions set by fired steps (ramp origins)
    settled: BTreeMap<u8, Position>,
}

impl ActiveRun {
    fn is_complete(&self) -> bool {
        self.next_step >= self.sequence.steps.len()
    }

    fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id,
            sequence_id: self.sequence.id,
            sequence_name: self.sequence.name.clone(),
            state: self.state,
            current_step_index: self.next_step,
            total_steps: self.sequence.steps.len(),
            started_at_ms: self.started_at_ms,
            elapsed_ms: self.elapsed_ms,
        }
    }

    fn notice(&self, reason: CompletionReason) -> CompletionNotice {
        CompletionNotice {
            run_id: self.run_id,
            sequence_id: self.sequence.id,
            sequence_name: self.sequence.name.clone(),
            reason,
            elapsed_ms: self.elapsed_ms,
            steps_fired: self.next_step,
            total_steps: self.sequence.steps.len(),
        }
    }

    fn fire_step(&mut self, step: &SequenceStep, directions: u16, calls: &mut Vec<HalCall>) {
        tracing::debug!(
            run_id = self.run_id,
            offset_ms = step.offset_ms,
            description = %step.description,
            "Firing step"
        );
        // Every listed channel is driven, even if it already sits there
        for (&channel, &position) in &step.actuator_positions {
            self.settled.insert(channel, position);
            calls.push(output_for(position, channel, directions).to_call(channel));
        }
        calls.extend(step.cues.iter().map(super::Cue::to_hal_call));
        self.next_step += 1;
    }

    /// Fire every step whose offset has been reached
    fn fire_due(&mut self, directions: u16, calls: &mut Vec<HalCall>) {
        let sequence = Arc::clone(&self.sequence);
        while let Some(step) = sequence.steps.get(self.next_step) {
            if step.offset_ms > self.elapsed_ms {
                break;
            }
            self.fire_step(step, directions, calls);
        }
    }

    /// Interpolate ramped channels of the pending step
    ///
    /// A channel already at the interpolated pulse is not driven again.
    fn ramp_pending(&self, directions: u16, positions: &ServoPositions, calls: &mut Vec<HalCall>) {
        let sequence = Arc::clone(&self.sequence);
        let Some(step) = sequence.steps.get(self.next_step) else {
            return;
        };
        if !step.ramp {
            return;
        }
        let from_ms = self
            .next_step
            .checked_sub(1)
            .and_then(|i| sequence.steps.get(i))
            .map_or(0, |s| s.offset_ms);
        let span = step.offset_ms.saturating_sub(from_ms);
        if span == 0 || self.elapsed_ms <= from_ms {
            return;
        }
        let progress = (self.elapsed_ms - from_ms).min(span);

        for (&channel, &target) in &step.actuator_positions {
            let (Some(to), Some(from)) = (
                target.pulse_us(),
                self.settled.get(&channel).and_then(|p| p.pulse_us()),
            ) else {
                continue;
            };
            let pulse = interpolate(from, to, progress, span);
            let pulse = if is_reversed(directions, channel) {
                mirror_pulse(pulse)
            } else {
                pulse
            };
            if positions.pulse(channel) != Some(pulse) {
                calls.push(HalCall::ServoSetPosition {
                    channel,
                    pulse_us: pulse,
                });
            }
        }
    }
}

/// Linear interpolation, clamped to the endpoints
fn interpolate(from: u16, to: u16, progress: u64, span: u64) -> u16 {
    let (from_i, to_i) = (i64::from(from), i64::from(to));
    let progress = i64::try_from(progress).unwrap_or(i64::MAX);
    let span = i64::try_from(span).unwrap_or(i64::MAX).max(1);
    let value = from_i + (to_i - from_i) * progress.min(span) / span;
    let value = value.clamp(from_i.min(to_i), from_i.max(to_i));
    u16::try_from(value).unwrap_or(to)
}

#[derive(Debug, Default)]
struct EngineState {
    now_ms: u64,
    carry_us: u64,
    next_run_id: u64,
    servo_directions: u16,
    active: Option<ActiveRun>,
    last: Option<RunStatus>,
}

impl EngineState {
    fn finish(&mut self, run: &ActiveRun, state: RunState) {
        let mut status = run.status();
        status.state = state;
        self.last = Some(status);
    }

    fn control_error(&self, action: RunAction) -> EngineError {
        let state = self.last.as_ref().map_or(RunState::Idle, |r| r.state);
        EngineError::InvalidTransition { action, state }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Sequence playback engine
pub struct SequenceEngine {
    hal: Arc<dyn Hal>,
    positions: Arc<ServoPositions>,
    library: RwLock<SequenceLibrary>,
    sequencer: Mutex<()>,
    state: Mutex<EngineState>,
    notices: broadcast::Sender<CompletionNotice>,
}

impl fmt::Debug for SequenceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("hal", &self.hal.name())
            .field("sequences", &self.library.read().len())
            .finish_non_exhaustive()
    }
}

impl SequenceEngine {
    /// Create an engine playing sequences from `library` on `hal`
    #[must_use]
    pub fn new(hal: Arc<dyn Hal>, library: SequenceLibrary) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            hal,
            positions: Arc::new(ServoPositions::new()),
            library: RwLock::new(library),
            sequencer: Mutex::new(()),
            state: Mutex::new(EngineState::default()),
            notices,
        }
    }

    /// Servo pulses last applied by playback or direct commands
    #[must_use]
    pub fn positions(&self) -> &Arc<ServoPositions> {
        &self.positions
    }

    /// Receive completion notices
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionNotice> {
        self.notices.subscribe()
    }

    /// Register a sequence
    ///
    /// # Errors
    ///
    /// `InvalidSequence` or `DuplicateSequence`.
    pub fn register(&self, sequence: Sequence) -> Result<Arc<Sequence>, EngineError> {
        self.library.write().register(sequence)
    }

    /// Load every sequence definition file in `dir`
    ///
    /// # Errors
    ///
    /// `Load` if the directory cannot be read.
    pub fn load_dir(&self, dir: &std::path::Path) -> Result<usize, EngineError> {
        self.library.write().load_dir(dir)
    }

    /// Look up a sequence
    #[must_use]
    pub fn sequence(&self, reference: &SequenceRef) -> Option<Arc<Sequence>> {
        self.library.read().get(reference)
    }

    /// All sequences ordered by id
    #[must_use]
    pub fn sequences(&self) -> Vec<Arc<Sequence>> {
        self.library.read().iter().cloned().collect()
    }

    /// Set which servo channels are mounted in reverse (bit n-1 = channel n)
    pub fn set_servo_directions(&self, mask: u16) {
        self.state.lock().servo_directions = mask;
    }

    /// Snapshot of the engine and its active or last run
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let state = self.state.lock();
        EngineStatus {
            now_ms: state.now_ms,
            run: state
                .active
                .as_ref()
                .map(ActiveRun::status)
                .or_else(|| state.last.clone()),
        }
    }

    /// Start a sequence, superseding any active run
    ///
    /// Steps at offset zero fire before this returns.
    ///
    /// # Errors
    ///
    /// `UnknownSequence` if nothing matches `reference`.
    pub fn start(&self, reference: &SequenceRef) -> Result<RunStatus, EngineError> {
        let sequence = self
            .sequence(reference)
            .ok_or_else(|| EngineError::UnknownSequence(reference.clone()))?;

        let _sequencer = self.sequencer.lock();
        let (superseded, status, calls) = {
            let mut state = self.state.lock();

            let superseded = state.active.take().map(|old| {
                state.finish(&old, RunState::Stopped);
                old.notice(CompletionReason::Superseded)
            });

            state.next_run_id += 1;
            let mut run = ActiveRun {
                run_id: state.next_run_id,
                sequence,
                state: RunState::Running,
                started_at_ms: state.now_ms,
                elapsed_ms: 0,
                next_step: 0,
                settled: BTreeMap::new(),
            };
            let mut calls = Vec::new();
            run.fire_due(state.servo_directions, &mut calls);
            let status = run.status();
            state.active = Some(run);
            (superseded, status, calls)
        };

        if let Some(notice) = superseded {
            tracing::info!(run_id = notice.run_id, sequence = %notice.sequence_name, "Run superseded");
            let _ = self.notices.send(notice);
        }
        tracing::info!(run_id = status.run_id, sequence = %status.sequence_name, "Sequence started");
        self.apply(&calls);

        // A sequence whose steps all sit at offset zero is already done
        let mut report = TickReport::default();
        self.complete_if_done(&mut report);
        match report.completed {
            Some(notice) => Ok(RunStatus {
                state: RunState::Completed,
                current_step_index: notice.steps_fired,
                ..status
            }),
            None => Ok(status),
        }
    }

    /// Stop the active run
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if no run is active.
    pub fn stop(&self) -> Result<CompletionNotice, EngineError> {
        let _sequencer = self.sequencer.lock();
        let notice = {
            let mut state = self.state.lock();
            let Some(run) = state.active.take() else {
                return Err(state.control_error(RunAction::Stop));
            };
            state.finish(&run, RunState::Stopped);
            run.notice(CompletionReason::Stopped)
        };
        tracing::info!(run_id = notice.run_id, sequence = %notice.sequence_name, "Sequence stopped");
        let _ = self.notices.send(notice.clone());
        Ok(notice)
    }

    /// Pause the running run
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless a run is `Running`.
    pub fn pause(&self) -> Result<RunStatus, EngineError> {
        self.transition(RunAction::Pause, RunState::Running, RunState::Paused)
    }

    /// Resume the paused run
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless a run is `Paused`.
    pub fn resume(&self) -> Result<RunStatus, EngineError> {
        self.transition(RunAction::Resume, RunState::Paused, RunState::Running)
    }

    fn transition(
        &self,
        action: RunAction,
        from: RunState,
        to: RunState,
    ) -> Result<RunStatus, EngineError> {
        let mut state = self.state.lock();
        let Some(run) = state.active.as_mut() else {
            return Err(state.control_error(action));
        };
        if run.state != from {
            return Err(EngineError::InvalidTransition {
                action,
                state: run.state,
            });
        }
        run.state = to;
        tracing::info!(run_id = run.run_id, %action, elapsed_ms = run.elapsed_ms, "Sequence {}", to);
        Ok(run.status())
    }

    /// Fire the next offset group of a paused run
    ///
    /// The run's clock jumps to that offset and the run stays paused, or
    /// completes if that was the last group.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless a run is `Paused`.
    pub fn step(&self) -> Result<RunStatus, EngineError> {
        let _sequencer = self.sequencer.lock();
        let (status, calls) = {
            let mut state = self.state.lock();
            let directions = state.servo_directions;
            let Some(run) = state.active.as_mut() else {
                return Err(state.control_error(RunAction::Step));
            };
            if run.state != RunState::Paused {
                return Err(EngineError::InvalidTransition {
                    action: RunAction::Step,
                    state: run.state,
                });
            }
            let mut calls = Vec::new();
            if let Some(next) = run.sequence.steps.get(run.next_step) {
                run.elapsed_ms = run.elapsed_ms.max(next.offset_ms);
                run.fire_due(directions, &mut calls);
            }
            (run.status(), calls)
        };
        self.apply(&calls);

        let mut report = TickReport::default();
        self.complete_if_done(&mut report);
        match report.completed {
            Some(notice) => Ok(RunStatus {
                state: RunState::Completed,
                current_step_index: notice.steps_fired,
                ..status
            }),
            None => Ok(status),
        }
    }

    /// Advance the virtual clock by `delta` and fire whatever became due
    pub fn advance(&self, delta: Duration) -> TickReport {
        let _sequencer = self.sequencer.lock();
        let mut report = TickReport::default();
        {
            let mut state = self.state.lock();
            let total_us =
                state.carry_us + u64::try_from(delta.as_micros()).unwrap_or(u64::MAX / 2);
            let delta_ms = total_us / 1000;
            state.carry_us = total_us % 1000;
            state.now_ms += delta_ms;

            let directions = state.servo_directions;
            if let Some(run) = state.active.as_mut() {
                if run.state == RunState::Running {
                    run.elapsed_ms += delta_ms;
                    run.fire_due(directions, &mut report.calls);
                    run.ramp_pending(directions, &self.positions, &mut report.calls);
                }
            }
        }

        report.failures = self.apply(&report.calls);
        self.complete_if_done(&mut report);
        report
    }

    /// Advance the virtual clock by whole milliseconds
    pub fn advance_ms(&self, ms: u64) -> TickReport {
        self.advance(Duration::from_millis(ms))
    }

    fn complete_if_done(&self, report: &mut TickReport) {
        let notice = {
            let mut state = self.state.lock();
            match state.active.take() {
                Some(run) if run.is_complete() => {
                    state.finish(&run, RunState::Completed);
                    Some(run.notice(CompletionReason::Completed))
                }
                other => {
                    state.active = other;
                    None
                }
            }
        };
        if let Some(notice) = notice {
            tracing::info!(
                run_id = notice.run_id,
                sequence = %notice.sequence_name,
                elapsed_ms = notice.elapsed_ms,
                steps = notice.steps_fired,
                "Sequence completed"
            );
            let _ = self.notices.send(notice.clone());
            report.completed = Some(notice);
        }
    }

    fn apply(&self, calls: &[HalCall]) -> Vec<HalError> {
        calls
            .iter()
            .filter_map(|call| match call.apply(self.hal.as_ref()) {
                Ok(()) => {
                    self.positions.observe(call);
                    None
                }
                Err(e) => {
                    tracing::warn!(call = %call, error = %e, "Sequence HAL call failed");
                    Some(e)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::LoggerBackend;
    use crate::sequence::{Cue, SequenceBuilder, SequenceStep};
    use pretty_assertions::assert_eq;

    fn engine_with(sequences: Vec<Sequence>) -> (Arc<LoggerBackend>, SequenceEngine) {
        let hal = Arc::new(LoggerBackend::new());
        let mut library = SequenceLibrary::empty();
        for s in sequences {
            library.register(s).unwrap();
        }
        let engine = SequenceEngine::new(hal.clone(), library);
        (hal, engine)
    }

    fn set(channel: u8, pulse_us: u16) -> HalCall {
        HalCall::ServoSetPosition { channel, pulse_us }
    }

    fn three_step() -> Sequence {
        SequenceBuilder::new(70, "three")
            .step(0, "open 1", [(1, Position::Open)])
            .step(100, "open 2", [(2, Position::Open)])
            .step(200, "close both", [(1, Position::Closed), (2, Position::Closed)])
            .build()
    }

    #[test]
    fn test_start_fires_offset_zero_immediately() {
        let (hal, engine) = engine_with(vec![three_step()]);
        let status = engine.start(&SequenceRef::Id(70)).unwrap();
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.current_step_index, 1);
        assert_eq!(hal.take_calls(), vec![set(1, 1000)]);
    }

    #[test]
    fn test_ticks_fire_steps_and_complete() {
        let (hal, engine) = engine_with(vec![three_step()]);
        let mut notices = engine.subscribe();
        engine.start(&SequenceRef::Name("three".into())).unwrap();
        hal.clear();

        assert!(engine.advance_ms(50).calls.is_empty());
        assert_eq!(engine.advance_ms(50).calls, vec![set(2, 1000)]);

        let report = engine.advance_ms(100);
        assert_eq!(report.calls, vec![set(1, 2000), set(2, 2000)]);
        let notice = report.completed.unwrap();
        assert_eq!(notice.reason, CompletionReason::Completed);
        assert_eq!(notice.elapsed_ms, 200);
        assert_eq!(notice.steps_fired, 3);
        assert_eq!(notice.total_steps, 3);

        assert_eq!(notices.try_recv().unwrap().reason, CompletionReason::Completed);
        assert_eq!(engine.status().state(), RunState::Completed);
    }

    #[test]
    fn test_large_tick_fires_all_due_steps_in_order() {
        let (hal, engine) = engine_with(vec![three_step()]);
        engine.start(&SequenceRef::Id(70)).unwrap();
        hal.clear();
        let report = engine.advance_ms(1000);
        assert_eq!(
            report.calls,
            vec![set(2, 1000), set(1, 2000), set(2, 2000)]
        );
        assert!(report.completed.is_some());
    }

    #[test]
    fn test_equal_offsets_fire_in_list_order() {
        let seq = SequenceBuilder::new(71, "ties")
            .step(0, "a", [(1, Position::Open)])
            .step(10, "b", [(3, Position::Open)])
            .step(10, "c", [(2, Position::Open)])
            .build();
        let (hal, engine) = engine_with(vec![seq]);
        engine.start(&SequenceRef::Id(71)).unwrap();
        hal.clear();
        assert_eq!(engine.advance_ms(10).calls, vec![set(3, 1000), set(2, 1000)]);
    }

    #[test]
    fn test_listed_positions_are_reissued_every_step() {
        let seq = SequenceBuilder::new(72, "same")
            .step(0, "a", [(1, Position::Open), (2, Position::Closed)])
            .step(10, "b", [(1, Position::Open), (2, Position::Open)])
            .step(20, "c", [(2, Position::NoPulse)])
            .build();
        let (hal, engine) = engine_with(vec![seq]);
        engine.start(&SequenceRef::Id(72)).unwrap();
        hal.clear();
        assert_eq!(engine.advance_ms(10).calls, vec![set(1, 1000), set(2, 1000)]);
        assert_eq!(
            engine.advance_ms(10).calls,
            vec![HalCall::ServoRelease { channel: 2 }]
        );
        assert_eq!(engine.positions().pulse(1), Some(1000));
        assert_eq!(engine.positions().pulse(2), None);
    }

    #[test]
    fn test_step_drives_channel_moved_by_someone_else() {
        let seq = SequenceBuilder::new(76, "reopen")
            .step(0, "open 1", [(1, Position::Open)])
            .step(100, "open 1 again", [(1, Position::Open)])
            .build();
        let (hal, engine) = engine_with(vec![seq]);
        engine.start(&SequenceRef::Id(76)).unwrap();

        // A direct command closes the panel between the two steps
        let close = set(1, 2000);
        close.apply(hal.as_ref()).unwrap();
        engine.positions().observe(&close);
        hal.clear();

        assert_eq!(engine.advance_ms(150).calls, vec![set(1, 1000)]);
        assert_eq!(hal.calls(), vec![set(1, 1000)]);
    }

    #[test]
    fn test_ramp_skips_pulses_already_applied() {
        let seq = SequenceBuilder::new(77, "slow")
            .step(0, "open", [(1, Position::Open)])
            .step(1000, "close slowly", [(1, Position::Closed)])
            .ramp()
            .build();
        let (hal, engine) = engine_with(vec![seq]);
        engine.start(&SequenceRef::Id(77)).unwrap();
        hal.clear();

        // 1 ms moves the ramp by 1 us: the first tick drives, the repeat does not
        assert_eq!(engine.advance_ms(1).calls, vec![set(1, 1001)]);
        engine.positions().observe(&set(1, 1002));
        assert!(engine.advance_ms(1).calls.is_empty());
    }

    #[test]
    fn test_pause_freezes_virtual_time() {
        let (hal, engine) = engine_with(vec![three_step()]);
        engine.start(&SequenceRef::Id(70)).unwrap();
        engine.advance_ms(50);
        engine.pause().unwrap();
        hal.clear();

        assert!(engine.advance_ms(10_000).calls.is_empty());
        assert_eq!(engine.status().run.unwrap().elapsed_ms, 50);

        engine.resume().unwrap();
        assert!(engine.advance_ms(49).calls.is_empty());
        assert_eq!(engine.advance_ms(1).calls, vec![set(2, 1000)]);
    }

    #[test]
    fn test_invalid_transitions() {
        let (_hal, engine) = engine_with(vec![three_step()]);
        assert_eq!(
            engine.pause(),
            Err(EngineError::InvalidTransition {
                action: RunAction::Pause,
                state: RunState::Idle
            })
        );
        assert!(matches!(
            engine.stop(),
            Err(EngineError::InvalidTransition { .. })
        ));

        engine.start(&SequenceRef::Id(70)).unwrap();
        assert_eq!(
            engine.resume(),
            Err(EngineError::InvalidTransition {
                action: RunAction::Resume,
                state: RunState::Running
            })
        );
        assert!(matches!(
            engine.step(),
            Err(EngineError::InvalidTransition { .. })
        ));

        engine.pause().unwrap();
        assert!(matches!(
            engine.pause(),
            Err(EngineError::InvalidTransition { .. })
        ));

        engine.stop().unwrap();
        assert_eq!(
            engine.resume(),
            Err(EngineError::InvalidTransition {
                action: RunAction::Resume,
                state: RunState::Stopped
            })
        );
    }

    #[test]
    fn test_stop_takes_effect_before_next_tick() {
        let (hal, engine) = engine_with(vec![three_step()]);
        engine.start(&SequenceRef::Id(70)).unwrap();
        hal.clear();

        let notice = engine.stop().unwrap();
        assert_eq!(notice.reason, CompletionReason::Stopped);
        assert_eq!(notice.steps_fired, 1);

        assert!(engine.advance_ms(1000).calls.is_empty());
        assert!(hal.calls().is_empty());
        assert_eq!(engine.status().state(), RunState::Stopped);
    }

    #[test]
    fn test_supersede_emits_one_notice() {
        let other = SequenceBuilder::new(73, "other")
            .step(0, "open 5", [(5, Position::Open)])
            .step(500, "close 5", [(5, Position::Closed)])
            .build();
        let (hal, engine) = engine_with(vec![three_step(), other]);
        let mut notices = engine.subscribe();

        engine.start(&SequenceRef::Id(70)).unwrap();
        engine.start(&SequenceRef::Id(73)).unwrap();

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.reason, CompletionReason::Superseded);
        assert_eq!(notice.sequence_id, 70);
        assert!(notices.try_recv().is_err());

        hal.clear();
        let report = engine.advance_ms(500);
        assert_eq!(report.calls, vec![set(5, 2000)]);
    }

    #[test]
    fn test_step_fires_next_group_while_paused() {
        let (hal, engine) = engine_with(vec![three_step()]);
        engine.start(&SequenceRef::Id(70)).unwrap();
        engine.pause().unwrap();
        hal.clear();

        let status = engine.step().unwrap();
        assert_eq!(status.state, RunState::Paused);
        assert_eq!(status.elapsed_ms, 100);
        assert_eq!(hal.take_calls(), vec![set(2, 1000)]);

        let status = engine.step().unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(hal.take_calls(), vec![set(1, 2000), set(2, 2000)]);
    }

    #[test]
    fn test_ramp_stays_between_endpoints_and_lands_exactly() {
        let seq = SequenceBuilder::new(74, "ramp")
            .step(0, "open", [(1, Position::Open)])
            .step(100, "close slowly", [(1, Position::Closed)])
            .ramp()
            .build();
        let (hal, engine) = engine_with(vec![seq]);
        engine.start(&SequenceRef::Id(74)).unwrap();
        hal.clear();

        let mut pulses = Vec::new();
        for _ in 0..10 {
            for call in engine.advance_ms(10).calls {
                if let HalCall::ServoSetPosition { pulse_us, .. } = call {
                    pulses.push(pulse_us);
                }
            }
        }
        assert!(pulses.iter().all(|p| (1000..=2000).contains(p)));
        assert!(pulses.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(pulses.first(), Some(&1100));
        assert_eq!(pulses.last(), Some(&2000));
    }

    #[test]
    fn test_reversed_channels_are_mirrored() {
        let (hal, engine) = engine_with(vec![three_step()]);
        engine.set_servo_directions(0b1);
        engine.start(&SequenceRef::Id(70)).unwrap();
        assert_eq!(hal.take_calls(), vec![set(1, 2000)]);
    }

    #[test]
    fn test_cues_follow_servo_moves() {
        let seq = Sequence {
            id: 75,
            name: "cued".into(),
            includes_sound_and_light: true,
            steps: vec![SequenceStep {
                offset_ms: 0,
                actuator_positions: [(1, Position::Open)].into_iter().collect(),
                description: "go".into(),
                cues: vec![Cue::SoundStop],
                ramp: false,
            }],
        };
        let (hal, engine) = engine_with(vec![seq]);
        let status = engine.start(&SequenceRef::Id(75)).unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(hal.take_calls(), vec![set(1, 1000), HalCall::SoundStopAll]);
    }

    #[test]
    fn test_unknown_sequence() {
        let (_hal, engine) = engine_with(vec![]);
        assert_eq!(
            engine.start(&SequenceRef::Name("nope".into())),
            Err(EngineError::UnknownSequence(SequenceRef::Name("nope".into())))
        );
    }

    #[test]
    fn test_sub_millisecond_deltas_accumulate() {
        let (hal, engine) = engine_with(vec![three_step()]);
        engine.start(&SequenceRef::Id(70)).unwrap();
        hal.clear();
        for _ in 0..200 {
            engine.advance(Duration::from_micros(500));
        }
        assert_eq!(engine.status().run.unwrap().elapsed_ms, 100);
        assert_eq!(hal.calls(), vec![set(2, 1000)]);
    }
}
