//! Simulated HAL backend
//!
//! Keeps the state real hardware would be in after each call, so tests and
//! dry runs can ask "is panel 3 open?" instead of replaying a call log.
//! Failures can be injected per capability to exercise error paths.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use super::call::{DomeDirection, HalCall, PatternParam};
use super::traits::{Dome, Hal, HalResult, I2cBus, Leds, Motors, Servos, Sound};
use super::{Capability, HalError, SERVO_MAX_US, SERVO_MIN_US};
use crate::protocol::VolumeStep;

/// Volume after power-on and after `m`
const VOLUME_MID: u8 = 50;

/// Volume change per `+`/`-`
const VOLUME_STEP: u8 = 10;

/// I2C writes kept in [`SimState::i2c_writes`]
pub const I2C_HISTORY: usize = 64;

/// Simulated hardware state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimState {
    /// Commanded pulse per servo channel; `None` once released
    pub servos: BTreeMap<u8, Option<u16>>,
    /// Left and right motor speed
    pub motors: (i16, i16),
    /// Dome rotation, `None` when stopped
    pub dome: Option<(DomeDirection, u8)>,
    /// Volume 0-100
    pub volume: u8,
    /// Random idle sounds enabled
    pub random_sound: bool,
    /// Last track started, `None` after stop
    pub playing: Option<(u8, Option<u8>)>,
    /// Last pattern per pattern family (`holo`, `display`, ...)
    pub patterns: BTreeMap<String, (String, Vec<PatternParam>)>,
    /// Most recent I2C writes, oldest first, at most [`I2C_HISTORY`]
    pub i2c_writes: VecDeque<(u8, Vec<u8>)>,
    /// Total calls accepted
    pub calls: u64,
}

/// HAL backend that simulates hardware state
#[derive(Debug)]
pub struct SimBackend {
    channels: u8,
    state: Mutex<SimState>,
    failures: Mutex<HashMap<Capability, String>>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// Create a simulator with 16 servo channels
    #[must_use]
    pub fn new() -> Self {
        Self::with_channels(super::DEFAULT_SERVO_CHANNELS)
    }

    /// Create a simulator with `channels` servo channels
    #[must_use]
    pub fn with_channels(channels: u8) -> Self {
        Self {
            channels,
            state: Mutex::new(SimState {
                volume: VOLUME_MID,
                ..SimState::default()
            }),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the simulated state
    #[must_use]
    pub fn state(&self) -> SimState {
        self.state.lock().clone()
    }

    /// Commanded pulse of `channel`, `None` if released or never driven
    #[must_use]
    pub fn servo(&self, channel: u8) -> Option<u16> {
        self.state.lock().servos.get(&channel).copied().flatten()
    }

    /// Make every call on `capability` fail with `message`
    pub fn inject_failure(&self, capability: Capability, message: impl Into<String>) {
        self.failures.lock().insert(capability, message.into());
    }

    /// Stop failing calls on `capability`
    pub fn clear_failure(&self, capability: Capability) {
        self.failures.lock().remove(&capability);
    }

    fn apply(&self, call: &HalCall) -> HalResult {
        let capability = call.capability();
        if let Some(message) = self.failures.lock().get(&capability) {
            tracing::debug!(%capability, %message, "Injected HAL failure");
            return Err(HalError::new(capability, message.clone()));
        }

        let mut state = self.state.lock();
        match call {
            HalCall::MotorsSetSpeed { left, right } => state.motors = (*left, *right),
            HalCall::MotorsStop => state.motors = (0, 0),
            HalCall::DomeRotate { direction, speed } => state.dome = Some((*direction, *speed)),
            HalCall::DomeStop => state.dome = None,
            HalCall::ServoSetPosition { channel, pulse_us } => {
                self.check_channel(*channel)?;
                if !(SERVO_MIN_US..=SERVO_MAX_US).contains(pulse_us) {
                    return Err(HalError::new(
                        capability,
                        format!("pulse {pulse_us}us outside {SERVO_MIN_US}-{SERVO_MAX_US}"),
                    ));
                }
                state.servos.insert(*channel, Some(*pulse_us));
            }
            HalCall::ServoRelease { channel } => {
                self.check_channel(*channel)?;
                state.servos.insert(*channel, None);
            }
            HalCall::LedsSetPattern { pattern, params } => {
                let family = pattern.split('.').next().unwrap_or(pattern).to_string();
                state
                    .patterns
                    .insert(family, (pattern.clone(), params.clone()));
            }
            HalCall::SoundPlay { bank, index } => state.playing = Some((*bank, *index)),
            HalCall::SoundStopAll => state.playing = None,
            HalCall::SoundVolume { step } => {
                state.volume = match step {
                    VolumeStep::Up => state.volume.saturating_add(VOLUME_STEP).min(100),
                    VolumeStep::Down => state.volume.saturating_sub(VOLUME_STEP),
                    VolumeStep::Mid => VOLUME_MID,
                    VolumeStep::Max => 100,
                    VolumeStep::Min => 0,
                };
            }
            HalCall::SoundRandom { enabled } => state.random_sound = *enabled,
            HalCall::I2cWrite { address, data } => {
                if state.i2c_writes.len() == I2C_HISTORY {
                    state.i2c_writes.pop_front();
                }
                state.i2c_writes.push_back((*address, data.clone()));
            }
        }
        state.calls += 1;
        Ok(())
    }

    fn check_channel(&self, channel: u8) -> HalResult {
        if channel == 0 || channel > self.channels {
            return Err(HalError::new(
                Capability::Servos,
                format!("channel {channel} outside 1-{}", self.channels),
            ));
        }
        Ok(())
    }
}

impl Motors for SimBackend {
    fn set_speed(&self, left: i16, right: i16) -> HalResult {
        self.apply(&HalCall::MotorsSetSpeed { left, right })
    }

    fn stop(&self) -> HalResult {
        self.apply(&HalCall::MotorsStop)
    }
}

impl Dome for SimBackend {
    fn rotate(&self, direction: DomeDirection, speed: u8) -> HalResult {
        self.apply(&HalCall::DomeRotate { direction, speed })
    }

    fn stop(&self) -> HalResult {
        self.apply(&HalCall::DomeStop)
    }
}

impl Servos for SimBackend {
    fn set_position(&self, channel: u8, pulse_us: u16) -> HalResult {
        self.apply(&HalCall::ServoSetPosition { channel, pulse_us })
    }

    fn release(&self, channel: u8) -> HalResult {
        self.apply(&HalCall::ServoRelease { channel })
    }

    fn channel_count(&self) -> u8 {
        self.channels
    }
}

impl Leds for SimBackend {
    fn set_pattern(&self, pattern_id: &str, params: &[PatternParam]) -> HalResult {
        self.apply(&HalCall::LedsSetPattern {
            pattern: pattern_id.to_string(),
            params: params.to_vec(),
        })
    }
}

impl Sound for SimBackend {
    fn play(&self, bank: u8, index: Option<u8>) -> HalResult {
        self.apply(&HalCall::SoundPlay { bank, index })
    }

    fn stop_all(&self) -> HalResult {
        self.apply(&HalCall::SoundStopAll)
    }

    fn adjust_volume(&self, step: VolumeStep) -> HalResult {
        self.apply(&HalCall::SoundVolume { step })
    }

    fn set_random(&self, enabled: bool) -> HalResult {
        self.apply(&HalCall::SoundRandom { enabled })
    }
}

impl I2cBus for SimBackend {
    fn write(&self, address: u8, data: &[u8]) -> HalResult {
        self.apply(&HalCall::I2cWrite {
            address,
            data: data.to_vec(),
        })
    }
}

impl Hal for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn health_check(&self) -> bool {
        self.failures.lock().is_empty()
    }

    fn motors(&self) -> &dyn Motors {
        self
    }

    fn dome(&self) -> &dyn Dome {
        self
    }

    fn servos(&self) -> &dyn Servos {
        self
    }

    fn leds(&self) -> &dyn Leds {
        self
    }

    fn sound(&self) -> &dyn Sound {
        self
    }

    fn i2c(&self) -> &dyn I2cBus {
        self
    }
}
