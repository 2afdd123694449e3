//! Last pulse each servo channel was driven to
//!
//! Direct panel commands and sequence playback both drive the same servos.
//! They record what reached the hardware here, so `:HD` holds the position
//! the panel is actually in, whoever put it there.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::HalCall;

/// Pulses last applied per servo channel (after mirroring)
#[derive(Debug, Default)]
pub struct ServoPositions {
    pulses: Mutex<BTreeMap<u8, u16>>,
}

impl ServoPositions {
    /// Empty record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call that reached the HAL
    ///
    /// Calls that do not move a servo are ignored.
    pub fn observe(&self, call: &HalCall) {
        match *call {
            HalCall::ServoSetPosition { channel, pulse_us } => {
                self.pulses.lock().insert(channel, pulse_us);
            }
            HalCall::ServoRelease { channel } => {
                self.pulses.lock().remove(&channel);
            }
            _ => {}
        }
    }

    /// Pulse `channel` is held at, `None` if released or never driven
    #[must_use]
    pub fn pulse(&self, channel: u8) -> Option<u16> {
        self.pulses.lock().get(&channel).copied()
    }

    /// Every driven channel and its pulse
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<u8, u16> {
        self.pulses.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_and_release_are_tracked() {
        let positions = ServoPositions::new();
        positions.observe(&HalCall::ServoSetPosition {
            channel: 3,
            pulse_us: 1000,
        });
        positions.observe(&HalCall::ServoSetPosition {
            channel: 3,
            pulse_us: 2000,
        });
        positions.observe(&HalCall::SoundStopAll);
        assert_eq!(positions.pulse(3), Some(2000));

        positions.observe(&HalCall::ServoRelease { channel: 3 });
        assert_eq!(positions.pulse(3), None);
        assert!(positions.snapshot().is_empty());
    }
}
