//! Hardware Abstraction Layer
//!
//! Capability traits plus the two backends this crate ships:
//!
//! - [`LoggerBackend`]: records every call (and can export it as JSON)
//! - [`SimBackend`]: keeps simulated hardware state and can inject failures
//!
//! Real drivers live outside this crate and implement [`Hal`].

pub mod call;
pub mod logger;
pub mod positions;
pub mod sim;
pub mod traits;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use call::{pattern, DomeDirection, HalCall, PatternParam};
pub use logger::{LoggedCall, LoggerBackend};
pub use positions::ServoPositions;
pub use sim::{SimBackend, SimState};
pub use traits::{Dome, Hal, HalResult, I2cBus, Leds, Motors, Servos, Sound, DEFAULT_SERVO_CHANNELS};

// ============================================================================
// Servo pulse widths
// ============================================================================

/// Pulse width of a fully open panel
pub const SERVO_OPEN_US: u16 = 1000;

/// Pulse width of a half open panel
pub const SERVO_MID_US: u16 = 1750;

/// Pulse width of a closed panel
pub const SERVO_CLOSED_US: u16 = 2000;

/// Narrowest pulse a servo accepts
pub const SERVO_MIN_US: u16 = 500;

/// Widest pulse a servo accepts
pub const SERVO_MAX_US: u16 = 2500;

/// Mirror a pulse for a servo mounted in reverse
///
/// Open and closed swap places.
#[must_use]
pub fn mirror_pulse(pulse_us: u16) -> u16 {
    (SERVO_MIN_US + SERVO_MAX_US).saturating_sub(pulse_us)
}

/// HAL capability
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Drive motors
    Motors,
    /// Dome rotation
    Dome,
    /// Panel servos
    Servos,
    /// Lights
    Leds,
    /// Sound module
    Sound,
    /// Raw I2C bus
    I2c,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Motors => "motors",
            Self::Dome => "dome",
            Self::Servos => "servos",
            Self::Leds => "leds",
            Self::Sound => "sound",
            Self::I2c => "i2c",
        };
        f.write_str(name)
    }
}

/// A HAL call failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("HalCallFailed: {capability}: {message}")]
pub struct HalError {
    /// Capability that failed
    pub capability: Capability,
    /// Backend error message
    pub message: String,
}

impl HalError {
    /// Create a new error for `capability`
    pub fn new(capability: Capability, message: impl Into<String>) -> Self {
        Self {
            capability,
            message: message.into(),
        }
    }
}
