//! Logging HAL backend
//!
//! Accepts every call, emits a `tracing` event for it and keeps an in-memory
//! call log. The log can be exported as JSON for offline inspection.

use std::path::Path;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::call::{DomeDirection, HalCall, PatternParam};
use super::traits::{Dome, Hal, HalResult, I2cBus, Leds, Motors, Servos, Sound};
use crate::protocol::VolumeStep;

/// One recorded call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedCall {
    /// Position in the log, starting at 0
    pub seq: u64,
    /// Milliseconds since the backend was created
    pub at_ms: u64,
    /// The call itself
    #[serde(flatten)]
    pub call: HalCall,
}

/// HAL backend that records calls instead of driving hardware
#[derive(Debug)]
pub struct LoggerBackend {
    name: String,
    created: Instant,
    log: Mutex<Vec<LoggedCall>>,
}

impl Default for LoggerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerBackend {
    /// Create a backend with an empty log
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "logger".to_string(),
            created: Instant::now(),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Recorded calls, oldest first
    #[must_use]
    pub fn calls(&self) -> Vec<HalCall> {
        self.log.lock().iter().map(|c| c.call.clone()).collect()
    }

    /// Recorded calls with sequence numbers and timestamps
    #[must_use]
    pub fn entries(&self) -> Vec<LoggedCall> {
        self.log.lock().clone()
    }

    /// Remove and return every recorded call
    pub fn take_calls(&self) -> Vec<HalCall> {
        std::mem::take(&mut *self.log.lock())
            .into_iter()
            .map(|c| c.call)
            .collect()
    }

    /// Forget all recorded calls
    pub fn clear(&self) {
        self.log.lock().clear();
    }

    /// Call log as pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the log cannot be rendered.
    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.log.lock())
    }

    /// Write the call log to `path` as JSON
    ///
    /// # Errors
    ///
    /// Returns an I/O error if rendering or writing fails.
    pub fn save_log(&self, path: &Path) -> std::io::Result<()> {
        let json = self.export_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    fn record(&self, call: HalCall) -> HalResult {
        tracing::info!(backend = %self.name, call = %call, "HAL call");
        let at_ms = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut log = self.log.lock();
        let seq = log.len() as u64;
        log.push(LoggedCall { seq, at_ms, call });
        Ok(())
    }
}

impl Motors for LoggerBackend {
    fn set_speed(&self, left: i16, right: i16) -> HalResult {
        self.record(HalCall::MotorsSetSpeed { left, right })
    }

    fn stop(&self) -> HalResult {
        self.record(HalCall::MotorsStop)
    }
}

impl Dome for LoggerBackend {
    fn rotate(&self, direction: DomeDirection, speed: u8) -> HalResult {
        self.record(HalCall::DomeRotate { direction, speed })
    }

    fn stop(&self) -> HalResult {
        self.record(HalCall::DomeStop)
    }
}

impl Servos for LoggerBackend {
    fn set_position(&self, channel: u8, pulse_us: u16) -> HalResult {
        self.record(HalCall::ServoSetPosition { channel, pulse_us })
    }

    fn release(&self, channel: u8) -> HalResult {
        self.record(HalCall::ServoRelease { channel })
    }
}

impl Leds for LoggerBackend {
    fn set_pattern(&self, pattern_id: &str, params: &[PatternParam]) -> HalResult {
        self.record(HalCall::LedsSetPattern {
            pattern: pattern_id.to_string(),
            params: params.to_vec(),
        })
    }
}

impl Sound for LoggerBackend {
    fn play(&self, bank: u8, index: Option<u8>) -> HalResult {
        self.record(HalCall::SoundPlay { bank, index })
    }

    fn stop_all(&self) -> HalResult {
        self.record(HalCall::SoundStopAll)
    }

    fn adjust_volume(&self, step: VolumeStep) -> HalResult {
        self.record(HalCall::SoundVolume { step })
    }

    fn set_random(&self, enabled: bool) -> HalResult {
        self.record(HalCall::SoundRandom { enabled })
    }
}

impl I2cBus for LoggerBackend {
    fn write(&self, address: u8, data: &[u8]) -> HalResult {
        self.record(HalCall::I2cWrite {
            address,
            data: data.to_vec(),
        })
    }
}

impl Hal for LoggerBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn health_check(&self) -> bool {
        true
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
