//! HAL Capability Traits
//!
//! Trait definitions for the hardware the core drives. The dispatcher and the
//! sequence engine only ever talk to a [`Hal`]; whether the calls end up on a
//! PCA9685 board, in a simulator or in a log is decided once at construction.
//!
//! # Design Philosophy
//!
//! The HAL is split by capability:
//! - `motors`: drive motors
//! - `dome`: dome rotation
//! - `servos`: panel servos (pulse width in microseconds)
//! - `leds`: holoprojectors and logic displays (named patterns)
//! - `sound`: sound module
//! - `i2c`: raw bus writes
//!
//! Calls are synchronous and expected to return promptly. A failing call
//! returns [`HalError`]; the caller turns it into a failure result and never
//! retries.

use super::call::{DomeDirection, PatternParam};
use super::HalError;
use crate::protocol::VolumeStep;

/// Result of a single HAL call
pub type HalResult = Result<(), HalError>;

/// Default number of servo channels (one PCA9685 board)
pub const DEFAULT_SERVO_CHANNELS: u8 = 16;

/// Drive motors
pub trait Motors: Send + Sync {
    /// Set left and right motor speed (-127..=127, negative is reverse)
    fn set_speed(&self, left: i16, right: i16) -> HalResult;

    /// Stop both motors
    fn stop(&self) -> HalResult;
}

/// Dome rotation motor
pub trait Dome: Send + Sync {
    /// Rotate the dome at `speed` (0-127)
    fn rotate(&self, direction: DomeDirection, speed: u8) -> HalResult;

    /// Stop dome rotation
    fn stop(&self) -> HalResult;
}

/// Panel servo controller
pub trait Servos: Send + Sync {
    /// Drive `channel` (1-based) to `pulse_us`
    fn set_position(&self, channel: u8, pulse_us: u16) -> HalResult;

    /// Stop sending pulses to `channel`
    fn release(&self, channel: u8) -> HalResult;

    /// Number of addressable channels
    fn channel_count(&self) -> u8 {
        DEFAULT_SERVO_CHANNELS
    }
}

/// Light patterns for holoprojectors and logic displays
pub trait Leds: Send + Sync {
    /// Activate a named pattern
    fn set_pattern(&self, pattern_id: &str, params: &[PatternParam]) -> HalResult;
}

/// Sound module
pub trait Sound: Send + Sync {
    /// Play track `index` of `bank`, or the next track of the bank if `None`
    fn play(&self, bank: u8, index: Option<u8>) -> HalResult;

    /// Stop all playback
    fn stop_all(&self) -> HalResult;

    /// Adjust the output volume
    fn adjust_volume(&self, step: VolumeStep) -> HalResult;

    /// Enable or disable random idle sounds
    fn set_random(&self, enabled: bool) -> HalResult;
}

/// Raw I2C bus
pub trait I2cBus: Send + Sync {
    /// Write `data` to the 7-bit `address`
    fn write(&self, address: u8, data: &[u8]) -> HalResult;
}

/// Hardware abstraction layer
///
/// Implement this trait to add a backend.
pub trait Hal: Send + Sync {
    /// Backend name (e.g. "logger", "sim")
    fn name(&self) -> &str;

    /// Check if the backend is healthy
    fn health_check(&self) -> bool;

    /// Drive motors
    fn motors(&self) -> &dyn Motors;

    /// Dome rotation
    fn dome(&self) -> &dyn Dome;

    /// Panel servos
    fn servos(&self) -> &dyn Servos;

    /// Lights
    fn leds(&self) -> &dyn Leds;

    /// Sound module
    fn sound(&self) -> &dyn Sound;

    /// Raw I2C bus
    fn i2c(&self) -> &dyn I2cBus;
}
