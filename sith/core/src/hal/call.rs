//! HAL calls as values
//!
//! The sequence engine decides what to do under its lock and applies the
//! resulting [`HalCall`]s after releasing it. The logger backend records the
//! same values, which makes call streams comparable in tests.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Capability, Hal, HalError};
use crate::protocol::VolumeStep;

/// Light pattern ids understood by the LED capability
pub mod pattern {
    /// Holoprojector lights on (`unit`)
    pub const HOLO_ON: &str = "holo.on";
    /// Holoprojector lights off (`unit`)
    pub const HOLO_OFF: &str = "holo.off";
    /// Holoprojector random movement (`unit`)
    pub const HOLO_RANDOM: &str = "holo.random";
    /// Holoprojector hold position (`unit`)
    pub const HOLO_HOLD: &str = "holo.hold";
    /// Holoprojector stop and reset (`unit`)
    pub const HOLO_STOP: &str = "holo.stop";
    /// Holoprojector under RC control (`unit`)
    pub const HOLO_RC: &str = "holo.rc";
    /// Holoprojector test pattern (`unit`)
    pub const HOLO_TEST: &str = "holo.test";
    /// Holoprojector flash (`unit`, `seconds`)
    pub const HOLO_FLASH: &str = "holo.flash";
    /// Holoprojector flicker (`unit`, `seconds`)
    pub const HOLO_FLICKER: &str = "holo.flicker";
    /// Logic display mode (`unit`, `mode`)
    pub const DISPLAY_MODE: &str = "display.mode";
    /// Logic display wait (`unit`, `seconds`)
    pub const DISPLAY_WAIT: &str = "display.wait";
    /// Logic display scrolling text (`unit`, `text`)
    pub const DISPLAY_MESSAGE: &str = "display.message";
}

/// Dome rotation direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomeDirection {
    /// Clockwise seen from above
    Clockwise,
    /// Counter-clockwise seen from above
    CounterClockwise,
}

/// Parameter of a light pattern
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternParam {
    /// Numeric parameter (unit, mode, seconds)
    Int(u32),
    /// Text parameter (display message)
    Text(String),
}

impl fmt::Display for PatternParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// One call against a HAL capability
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum HalCall {
    /// `motors.set_speed(left, right)`
    MotorsSetSpeed {
        /// Left motor speed
        left: i16,
        /// Right motor speed
        right: i16,
    },
    /// `motors.stop()`
    MotorsStop,
    /// `dome.rotate(direction, speed)`
    DomeRotate {
        /// Rotation direction
        direction: DomeDirection,
        /// Rotation speed
        speed: u8,
    },
    /// `dome.stop()`
    DomeStop,
    /// `servos.set_position(channel, pulse_us)`
    ServoSetPosition {
        /// 1-based servo channel
        channel: u8,
        /// Pulse width in microseconds
        pulse_us: u16,
    },
    /// `servos.release(channel)`
    ServoRelease {
        /// 1-based servo channel
        channel: u8,
    },
    /// `leds.set_pattern(pattern, params)`
    LedsSetPattern {
        /// Pattern identifier, e.g. `holo.on`
        pattern: String,
        /// Pattern parameters
        params: Vec<PatternParam>,
    },
    /// `sound.play(bank, index)`
    SoundPlay {
        /// Sound bank
        bank: u8,
        /// Track within the bank, `None` for next
        index: Option<u8>,
    },
    /// `sound.stop_all()`
    SoundStopAll,
    /// `sound.adjust_volume(step)`
    SoundVolume {
        /// Volume adjustment
        step: VolumeStep,
    },
    /// `sound.set_random(enabled)`
    SoundRandom {
        /// Random sounds on or off
        enabled: bool,
    },
    /// `i2c.write(address, data)`
    I2cWrite {
        /// 7-bit device address
        address: u8,
        /// Payload, hex encoded when serialized
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
}

impl HalCall {
    /// Capability this call targets
    #[must_use]
    pub fn capability(&self) -> Capability {
        match self {
            Self::MotorsSetSpeed { .. } | Self::MotorsStop => Capability::Motors,
            Self::DomeRotate { .. } | Self::DomeStop => Capability::Dome,
            Self::ServoSetPosition { .. } | Self::ServoRelease { .. } => Capability::Servos,
            Self::LedsSetPattern { .. } => Capability::Leds,
            Self::SoundPlay { .. }
            | Self::SoundStopAll
            | Self::SoundVolume { .. }
            | Self::SoundRandom { .. } => Capability::Sound,
            Self::I2cWrite { .. } => Capability::I2c,
        }
    }

    /// Issue this call against `hal`
    ///
    /// # Errors
    ///
    /// Returns the backend's `HalError` unchanged.
    pub fn apply(&self, hal: &dyn Hal) -> Result<(), HalError> {
        match self {
            Self::MotorsSetSpeed { left, right } => hal.motors().set_speed(*left, *right),
            Self::MotorsStop => hal.motors().stop(),
            Self::DomeRotate { direction, speed } => hal.dome().rotate(*direction, *speed),
            Self::DomeStop => hal.dome().stop(),
            Self::ServoSetPosition { channel, pulse_us } => {
                hal.servos().set_position(*channel, *pulse_us)
            }
            Self::ServoRelease { channel } => hal.servos().release(*channel),
            Self::LedsSetPattern { pattern, params } => hal.leds().set_pattern(pattern, params),
            Self::SoundPlay { bank, index } => hal.sound().play(*bank, *index),
            Self::SoundStopAll => hal.sound().stop_all(),
            Self::SoundVolume { step } => hal.sound().adjust_volume(*step),
            Self::SoundRandom { enabled } => hal.sound().set_random(*enabled),
            Self::I2cWrite { address, data } => hal.i2c().write(*address, data),
        }
    }
}

impl fmt::Display for HalCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MotorsSetSpeed { left, right } => write!(f, "motors.set_speed({left}, {right})"),
            Self::MotorsStop => f.write_str("motors.stop()"),
            Self::DomeRotate { direction, speed } => {
                write!(f, "dome.rotate({direction:?}, {speed})")
            }
            Self::DomeStop => f.write_str("dome.stop()"),
            Self::ServoSetPosition { channel, pulse_us } => {
                write!(f, "servos.set_position({channel}, {pulse_us})")
            }
            Self::ServoRelease { channel } => write!(f, "servos.release({channel})"),
            Self::LedsSetPattern { pattern, params } => {
                write!(f, "leds.set_pattern({pattern}")?;
                for p in params {
                    write!(f, ", {p}")?;
                }
                f.write_str(")")
            }
            Self::SoundPlay { bank, index } => match index {
                Some(i) => write!(f, "sound.play({bank}, {i})"),
                None => write!(f, "sound.play({bank})"),
            },
            Self::SoundStopAll => f.write_str("sound.stop_all()"),
            Self::SoundVolume { step } => write!(f, "sound.adjust_volume({step:?})"),
            Self::SoundRandom { enabled } => write!(f, "sound.set_random({enabled})"),
            Self::I2cWrite { address, data } => {
                write!(f, "i2c.write({address}, {})", hex::encode_upper(data))
            }
        }
    }
}

/// Serialize byte payloads as uppercase hex strings
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
