//! Command Dispatcher
//!
//! Routes each decoded [`Command`] to exactly one collaborator:
//!
//! ```text
//!                      ┌──► Hal            panels, lights, sound, I2C
//! Command ──► dispatch ├──► SequenceEngine `:SE` start and control
//!                      └──► ConfigStore    `#` setup
//! ```
//!
//! Nothing here is fatal. Collaborator errors come back as
//! [`DispatchResult::Failure`] and the caller moves on to the next frame.
//! Dispatch never retries.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigStore, ConfigStoreError, Setting, Settings, SoundModule};
use crate::hal::{
    mirror_pulse, pattern, Hal, HalCall, HalError, PatternParam, SERVO_CLOSED_US, SERVO_MID_US,
    SERVO_OPEN_US,
};
use crate::protocol::{Command, Opcode, Target, PANEL_COUNT};
use crate::sequence::{EngineError, SequenceEngine, SequenceRef};

/// Why a dispatch failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// HAL call failed
    #[error(transparent)]
    Hal(#[from] HalError),

    /// Sequence engine rejected the request
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Settings store rejected or could not persist the change
    #[error(transparent)]
    Config(#[from] ConfigStoreError),

    /// Command arguments do not fit the opcode
    #[error("ArgumentError: {opcode}: {reason}")]
    Argument {
        /// Opcode mnemonic
        opcode: &'static str,
        /// What was missing or wrong
        reason: String,
    },
}

/// Outcome of dispatching one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Command carried out
    Success {
        /// Optional human readable detail
        message: Option<String>,
    },
    /// Command failed; later commands are unaffected
    Failure {
        /// What went wrong
        error: DispatchError,
    },
}

impl DispatchResult {
    fn ok() -> Self {
        Self::Success { message: None }
    }

    fn with_message(message: impl Into<String>) -> Self {
        Self::Success {
            message: Some(message.into()),
        }
    }

    /// Whether the command succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Success detail, if any
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success { message } => message.as_deref(),
            Self::Failure { .. } => None,
        }
    }

    /// Failure cause, if any
    #[must_use]
    pub fn error(&self) -> Option<&DispatchError> {
        match self {
            Self::Failure { error } => Some(error),
            Self::Success { .. } => None,
        }
    }
}

impl From<Result<Self, DispatchError>> for DispatchResult {
    fn from(result: Result<Self, DispatchError>) -> Self {
        result.unwrap_or_else(|error| Self::Failure { error })
    }
}

impl fmt::Display for DispatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { message: None } => f.write_str("OK"),
            Self::Success {
                message: Some(message),
            } => write!(f, "OK {message}"),
            Self::Failure { error } => write!(f, "ERR {error}"),
        }
    }
}

/// Routes commands to the HAL, the sequence engine or the settings store
pub struct Dispatcher {
    hal: Arc<dyn Hal>,
    engine: Arc<SequenceEngine>,
    store: Arc<ConfigStore>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("hal", &self.hal.name())
            .field("positions", &self.engine.positions().snapshot())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher over its three collaborators
    ///
    /// The engine picks up the stored servo directions immediately.
    pub fn new(hal: Arc<dyn Hal>, engine: Arc<SequenceEngine>, store: Arc<ConfigStore>) -> Self {
        engine.set_servo_directions(store.snapshot().servo_directions);
        Self {
            hal,
            engine,
            store,
        }
    }

    /// Carry out one command
    pub fn dispatch(&self, command: &Command) -> DispatchResult {
        let result: DispatchResult = match command.opcode {
            Opcode::SequenceStart
            | Opcode::SequenceStop
            | Opcode::SequencePause
            | Opcode::SequenceResume
            | Opcode::SequenceStep => self.dispatch_sequence(command).into(),

            Opcode::Open | Opcode::Close | Opcode::RcRelease | Opcode::Stop | Opcode::Hold => {
                self.dispatch_panel(command).into()
            }

            Opcode::ServoDirections
            | Opcode::ServoReverse
            | Opcode::StartupSound
            | Opcode::QuietMode
            | Opcode::SlaveDelay
            | Opcode::SoundModule => self.dispatch_setup(command).into(),

            _ => self.dispatch_output(command).into(),
        };

        match &result {
            DispatchResult::Success { .. } => {
                tracing::debug!(command = %command.raw, result = %result, "Dispatched");
            }
            DispatchResult::Failure { error } => {
                tracing::warn!(command = %command.raw, error = %error, "Dispatch failed");
            }
        }
        result
    }

    // ========================================================================
    // Panels
    // ========================================================================

    fn channels(&self, target: Target) -> Vec<u8> {
        match target {
            Target::All => (1..=self.hal.servos().channel_count().min(PANEL_COUNT)).collect(),
            Target::Unit(n) | Target::Address(n) => vec![n],
            Target::Unaddressed => Vec::new(),
        }
    }

    fn dispatch_panel(&self, command: &Command) -> Result<DispatchResult, DispatchError> {
        let channels = self.channels(command.target);
        let settings = self.store.snapshot();
        let mut first_error = None;

        for channel in channels {
            let call = match command.opcode {
                Opcode::Open => position_call(channel, SERVO_OPEN_US, &settings),
                Opcode::Close => position_call(channel, SERVO_CLOSED_US, &settings),
                // Whatever drove the panel last, playback included
                Opcode::Hold => match self.engine.positions().pulse(channel) {
                    Some(pulse_us) => HalCall::ServoSetPosition { channel, pulse_us },
                    None => position_call(channel, SERVO_MID_US, &settings),
                },
                Opcode::RcRelease => {
                    tracing::info!(channel, "Panel handed over to RC");
                    HalCall::ServoRelease { channel }
                }
                _ => HalCall::ServoRelease { channel },
            };
            match call.apply(self.hal.as_ref()) {
                Ok(()) => self.engine.positions().observe(&call),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(DispatchResult::ok()),
        }
    }

    // ========================================================================
    // Sequences
    // ========================================================================

    fn dispatch_sequence(&self, command: &Command) -> Result<DispatchResult, DispatchError> {
        let message = match command.opcode {
            Opcode::SequenceStart => {
                let reference = sequence_ref(command)?;
                let status = self.engine.start(&reference)?;
                format!(
                    "sequence {:02} {} run {}",
                    status.sequence_id, status.sequence_name, status.run_id
                )
            }
            Opcode::SequenceStop => {
                let notice = self.engine.stop()?;
                format!("stopped {}", notice.sequence_name)
            }
            Opcode::SequencePause => {
                let status = self.engine.pause()?;
                format!("paused {} at {}ms", status.sequence_name, status.elapsed_ms)
            }
            Opcode::SequenceResume => {
                let status = self.engine.resume()?;
                format!("resumed {}", status.sequence_name)
            }
            _ => {
                let status = self.engine.step()?;
                format!(
                    "step {}/{} of {} ({})",
                    status.current_step_index,
                    status.total_steps,
                    status.sequence_name,
                    status.state
                )
            }
        };
        Ok(DispatchResult::with_message(message))
    }

    // ========================================================================
    // Setup
    // ========================================================================

    fn dispatch_setup(&self, command: &Command) -> Result<DispatchResult, DispatchError> {
        let setting = setup_setting(command)?;
        let result = self.store.set(setting);
        // Applied in memory even when persisting failed
        self.engine
            .set_servo_directions(self.store.snapshot().servo_directions);
        result?;
        Ok(DispatchResult::with_message(setting.to_string()))
    }

    // ========================================================================
    // Lights, sound, I2C
    // ========================================================================

    fn dispatch_output(&self, command: &Command) -> Result<DispatchResult, DispatchError> {
        let call = output_call(command)?;
        call.apply(self.hal.as_ref())?;
        Ok(DispatchResult::ok())
    }
}

// ============================================================================
// Command to call mapping
// ============================================================================

fn position_call(channel: u8, pulse_us: u16, settings: &Settings) -> HalCall {
    let pulse_us = if settings.is_reversed(channel) {
        mirror_pulse(pulse_us)
    } else {
        pulse_us
    };
    HalCall::ServoSetPosition { channel, pulse_us }
}

fn missing(opcode: Opcode, what: &str) -> DispatchError {
    DispatchError::Argument {
        opcode: opcode.mnemonic(),
        reason: format!("missing {what}"),
    }
}

fn int_arg(command: &Command, index: usize, what: &str) -> Result<u32, DispatchError> {
    command.int_arg(index).ok_or_else(|| missing(command.opcode, what))
}

fn narrow<T: TryFrom<u32>>(command: &Command, value: u32, what: &str) -> Result<T, DispatchError> {
    T::try_from(value).map_err(|_| DispatchError::Argument {
        opcode: command.opcode.mnemonic(),
        reason: format!("{what} {value} out of range"),
    })
}

fn unit_param(target: Target) -> PatternParam {
    match target {
        Target::Unit(n) | Target::Address(n) => PatternParam::Int(u32::from(n)),
        Target::All | Target::Unaddressed => PatternParam::Int(0),
    }
}

fn sequence_ref(command: &Command) -> Result<SequenceRef, DispatchError> {
    if let Some(name) = command.text_arg(0) {
        return Ok(SequenceRef::Name(name.to_string()));
    }
    let id = int_arg(command, 0, "sequence id")?;
    Ok(SequenceRef::Id(narrow(command, id, "sequence id")?))
}

fn setup_setting(command: &Command) -> Result<Setting, DispatchError> {
    let value = int_arg(command, 0, "value")?;
    let setting = match command.opcode {
        Opcode::ServoDirections => Setting::ServoDirections(if value == 0 { 0 } else { u16::MAX }),
        Opcode::ServoReverse => Setting::ServoReversed {
            channel: narrow(command, value, "channel")?,
            reversed: int_arg(command, 1, "direction")? != 0,
        },
        Opcode::StartupSound => Setting::StartupSound(narrow(command, value, "startup sound")?),
        Opcode::QuietMode => Setting::QuietMode(value != 0),
        Opcode::SlaveDelay => Setting::SlaveDelay(narrow(command, value, "slave delay")?),
        _ => {
            let code: u8 = narrow(command, value, "sound module")?;
            let module = SoundModule::from_code(code).ok_or_else(|| DispatchError::Argument {
                opcode: command.opcode.mnemonic(),
                reason: format!("unknown sound module {code}"),
            })?;
            Setting::SoundModule(module)
        }
    };
    Ok(setting)
}

fn light(command: &Command, pattern_id: &str, extra: Option<PatternParam>) -> HalCall {
    let mut params = vec![unit_param(command.target)];
    params.extend(extra);
    HalCall::LedsSetPattern {
        pattern: pattern_id.to_string(),
        params,
    }
}

fn output_call(command: &Command) -> Result<HalCall, DispatchError> {
    let seconds = |what| int_arg(command, 0, what).map(PatternParam::Int);

    let call = match command.opcode {
        Opcode::HoloOn => light(command, pattern::HOLO_ON, None),
        Opcode::HoloOff => light(command, pattern::HOLO_OFF, None),
        Opcode::HoloRandom => light(command, pattern::HOLO_RANDOM, None),
        Opcode::HoloHold => light(command, pattern::HOLO_HOLD, None),
        Opcode::HoloStop => light(command, pattern::HOLO_STOP, None),
        Opcode::HoloRc => light(command, pattern::HOLO_RC, None),
        Opcode::HoloTest => light(command, pattern::HOLO_TEST, None),
        Opcode::HoloFlash => light(command, pattern::HOLO_FLASH, Some(seconds("seconds")?)),
        Opcode::HoloFlicker => light(command, pattern::HOLO_FLICKER, Some(seconds("seconds")?)),
        Opcode::DisplayMode => light(command, pattern::DISPLAY_MODE, Some(seconds("mode")?)),
        Opcode::DisplayWait => light(command, pattern::DISPLAY_WAIT, Some(seconds("seconds")?)),
        Opcode::DisplayMessage => {
            let text = command
                .text_arg(0)
                .ok_or_else(|| missing(command.opcode, "message"))?;
            light(
                command,
                pattern::DISPLAY_MESSAGE,
                Some(PatternParam::Text(text.to_string())),
            )
        }

        Opcode::SoundPlay => {
            let bank = narrow(command, int_arg(command, 0, "bank")?, "bank")?;
            let index = command
                .int_arg(1)
                .map(|i| narrow(command, i, "track"))
                .transpose()?;
            HalCall::SoundPlay { bank, index }
        }
        Opcode::SoundNamed(sound) => {
            let (bank, index) = sound.bank_and_index();
            HalCall::SoundPlay {
                bank,
                index: Some(index),
            }
        }
        Opcode::SoundStop => HalCall::SoundStopAll,
        Opcode::SoundVolume(step) => HalCall::SoundVolume { step },
        Opcode::SoundRandomOn => HalCall::SoundRandom { enabled: true },
        Opcode::SoundRandomOff => HalCall::SoundRandom { enabled: false },

        Opcode::I2cWrite => {
            let Target::Address(address) = command.target else {
                return Err(missing(command.opcode, "device address"));
            };
            HalCall::I2cWrite {
                address,
                data: command.i2c_payload(),
            }
        }

        other => {
            return Err(DispatchError::Argument {
                opcode: other.mnemonic(),
                reason: "not an output command".into(),
            })
        }
    };
    Ok(call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigField, MemoryStorage};
    use crate::hal::{Capability, LoggerBackend, SimBackend};
    use crate::protocol::decode;
    use crate::sequence::{RunState, SequenceLibrary};
    use pretty_assertions::assert_eq;

    fn logger_dispatcher() -> (Arc<LoggerBackend>, Dispatcher) {
        let hal = Arc::new(LoggerBackend::new());
        let engine = Arc::new(SequenceEngine::new(hal.clone(), SequenceLibrary::with_builtins()));
        let store = Arc::new(ConfigStore::in_memory());
        let dispatcher = Dispatcher::new(hal.clone(), engine, store);
        (hal, dispatcher)
    }

    fn run(dispatcher: &Dispatcher, frame: &str) -> DispatchResult {
        dispatcher.dispatch(&decode(frame.as_bytes()).unwrap())
    }

    fn set(channel: u8, pulse_us: u16) -> HalCall {
        HalCall::ServoSetPosition { channel, pulse_us }
    }

    #[test]
    fn test_open_and_close_single_panel() {
        let (hal, d) = logger_dispatcher();
        assert!(run(&d, ":OP01").is_success());
        assert!(run(&d, ":CL01").is_success());
        assert_eq!(hal.calls(), vec![set(1, 1000), set(1, 2000)]);
    }

    #[test]
    fn test_all_target_covers_every_channel() {
        let (hal, d) = logger_dispatcher();
        run(&d, ":CL00");
        let calls = hal.take_calls();
        assert_eq!(calls.len(), 16);
        assert_eq!(calls[0], set(1, 2000));
        assert_eq!(calls[15], set(16, 2000));
    }

    #[test]
    fn test_stop_and_rc_release() {
        let (hal, d) = logger_dispatcher();
        run(&d, ":ST03");
        run(&d, ":RC04");
        assert_eq!(
            hal.calls(),
            vec![
                HalCall::ServoRelease { channel: 3 },
                HalCall::ServoRelease { channel: 4 }
            ]
        );
    }

    #[test]
    fn test_hold_reasserts_last_position_or_mid() {
        let (hal, d) = logger_dispatcher();
        run(&d, ":HD02");
        run(&d, ":OP02");
        run(&d, ":HD02");
        run(&d, ":ST02");
        run(&d, ":HD02");
        assert_eq!(
            hal.calls(),
            vec![
                set(2, 1750),
                set(2, 1000),
                set(2, 1000),
                HalCall::ServoRelease { channel: 2 },
                set(2, 1750),
            ]
        );
    }

    #[test]
    fn test_hold_keeps_position_set_by_playback() {
        let (hal, d) = logger_dispatcher();
        run(&d, ":OP01");
        assert!(run(&d, ":SE00").is_success());
        d.engine.advance_ms(100);
        hal.clear();

        run(&d, ":HD01");
        assert_eq!(hal.take_calls(), vec![set(1, 2000)]);

        // closeall releases every panel at 2 s
        d.engine.advance_ms(2000);
        hal.clear();
        run(&d, ":HD01");
        assert_eq!(hal.take_calls(), vec![set(1, 1750)]);
    }

    #[test]
    fn test_hold_on_reversed_servo_keeps_physical_pulse() {
        let (hal, d) = logger_dispatcher();
        run(&d, "#SR011");
        run(&d, ":OP01");
        run(&d, ":HD01");
        assert_eq!(hal.calls(), vec![set(1, 2000), set(1, 2000)]);
    }

    #[test]
    fn test_failed_move_is_not_recorded() {
        let hal = Arc::new(SimBackend::new());
        let engine = Arc::new(SequenceEngine::new(hal.clone(), SequenceLibrary::empty()));
        let d = Dispatcher::new(hal.clone(), engine, Arc::new(ConfigStore::in_memory()));
        run(&d, ":OP01");
        hal.inject_failure(Capability::Servos, "bus timeout");
        assert!(!run(&d, ":CL01").is_success());
        assert_eq!(d.engine.positions().pulse(1), Some(1000));
    }

    #[test]
    fn test_reversed_servo_is_mirrored() {
        let (hal, d) = logger_dispatcher();
        assert!(run(&d, "#SR011").is_success());
        run(&d, ":OP01");
        run(&d, ":OP02");
        assert_eq!(hal.calls(), vec![set(1, 2000), set(2, 1000)]);
    }

    #[test]
    fn test_sequence_start_and_control() {
        let (_hal, d) = logger_dispatcher();
        let started = run(&d, ":SE02");
        assert!(started.is_success());
        assert!(started.message().unwrap().contains("wave"));

        assert!(run(&d, ":SEPAUSE").is_success());
        assert!(run(&d, ":SESTEP").is_success());
        assert!(run(&d, ":SERESUME").is_success());
        assert!(run(&d, ":SESTOP").is_success());
        assert_eq!(d.engine.status().state(), RunState::Stopped);
    }

    #[test]
    fn test_sequence_misuse_is_failure_result() {
        let (_hal, d) = logger_dispatcher();
        let result = run(&d, ":SERESUME");
        assert!(matches!(
            result.error(),
            Some(DispatchError::Engine(EngineError::InvalidTransition { .. }))
        ));
        assert!(result.to_string().starts_with("ERR InvalidTransition"));

        let result = run(&d, ":SEnosuchthing");
        assert!(matches!(
            result.error(),
            Some(DispatchError::Engine(EngineError::UnknownSequence(_)))
        ));
    }

    #[test]
    fn test_sequence_by_name() {
        let (hal, d) = logger_dispatcher();
        assert!(run(&d, ":SEWave").is_success());
        assert!(hal.calls().len() >= 16);
    }

    #[test]
    fn test_holo_and_display_patterns() {
        let (hal, d) = logger_dispatcher();
        run(&d, "*ON02");
        run(&d, "*H105");
        run(&d, "@1MHello");
        run(&d, "@0T5");
        assert_eq!(
            hal.calls(),
            vec![
                HalCall::LedsSetPattern {
                    pattern: "holo.on".into(),
                    params: vec![PatternParam::Int(2)]
                },
                HalCall::LedsSetPattern {
                    pattern: "holo.flash".into(),
                    params: vec![PatternParam::Int(1), PatternParam::Int(5)]
                },
                HalCall::LedsSetPattern {
                    pattern: "display.message".into(),
                    params: vec![PatternParam::Int(1), PatternParam::Text("Hello".into())]
                },
                HalCall::LedsSetPattern {
                    pattern: "display.mode".into(),
                    params: vec![PatternParam::Int(0), PatternParam::Int(5)]
                },
            ]
        );
    }

    #[test]
    fn test_sound_commands() {
        let (hal, d) = logger_dispatcher();
        run(&d, "$3");
        run(&d, "$212");
        run(&d, "$S");
        run(&d, "$s");
        run(&d, "$+");
        run(&d, "$R");
        assert_eq!(
            hal.calls(),
            vec![
                HalCall::SoundPlay {
                    bank: 3,
                    index: None
                },
                HalCall::SoundPlay {
                    bank: 2,
                    index: Some(12)
                },
                HalCall::SoundPlay {
                    bank: 6,
                    index: Some(1)
                },
                HalCall::SoundStopAll,
                HalCall::SoundVolume {
                    step: crate::protocol::VolumeStep::Up
                },
                HalCall::SoundRandom { enabled: true },
            ]
        );
    }

    #[test]
    fn test_i2c_write() {
        let (hal, d) = logger_dispatcher();
        assert!(run(&d, "&42,x0A,255,'A'").is_success());
        assert_eq!(
            hal.calls(),
            vec![HalCall::I2cWrite {
                address: 42,
                data: vec![0x0A, 0xFF, b'A']
            }]
        );
    }

    #[test]
    fn test_setup_updates_store() {
        let hal = Arc::new(LoggerBackend::new());
        let engine = Arc::new(SequenceEngine::new(hal.clone(), SequenceLibrary::empty()));
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(ConfigStore::load(Arc::clone(&storage)));
        let d = Dispatcher::new(hal.clone(), engine, Arc::clone(&store));

        assert!(run(&d, "#SS02").is_success());
        assert!(run(&d, "#SQ01").is_success());
        assert!(run(&d, "#ST500").is_success());
        assert!(run(&d, "#SM01").is_success());
        let settings = store.snapshot();
        assert_eq!(settings.startup_sound, 2);
        assert!(settings.quiet_mode);
        assert_eq!(settings.slave_delay_ms, 500);
        assert_eq!(settings.sound_module, SoundModule::DfPlayer);
        assert!(storage.bytes().is_some());
        assert!(hal.calls().is_empty());
    }

    #[test]
    fn test_setup_write_failure_is_reported() {
        let hal = Arc::new(LoggerBackend::new());
        let engine = Arc::new(SequenceEngine::new(hal.clone(), SequenceLibrary::empty()));
        let storage = Arc::new(MemoryStorage::new());
        storage.set_fail_writes(true);
        let store = Arc::new(ConfigStore::load(Arc::clone(&storage)));
        let d = Dispatcher::new(hal, engine, Arc::clone(&store));

        let result = run(&d, "#SD01");
        assert!(matches!(
            result.error(),
            Some(DispatchError::Config(ConfigStoreError::Storage { .. }))
        ));
        assert_eq!(
            store.get(ConfigField::ServoDirections),
            Setting::ServoDirections(u16::MAX)
        );
    }

    #[test]
    fn test_hal_failure_becomes_failure_result() {
        let hal = Arc::new(SimBackend::new());
        hal.inject_failure(Capability::Sound, "amp offline");
        let engine = Arc::new(SequenceEngine::new(hal.clone(), SequenceLibrary::empty()));
        let d = Dispatcher::new(hal.clone(), engine, Arc::new(ConfigStore::in_memory()));

        let result = run(&d, "$s");
        assert_eq!(
            result.error(),
            Some(&DispatchError::Hal(HalError::new(Capability::Sound, "amp offline")))
        );
        assert!(run(&d, ":OP01").is_success());
    }
}
