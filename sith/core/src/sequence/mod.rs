//! Panel sequences
//!
//! A [`Sequence`] is an immutable, timed list of [`SequenceStep`]s. The
//! [`SequenceLibrary`] holds the builtin catalogue plus user registrations in
//! one ordered mapping, and the [`SequenceEngine`] plays at most one of them
//! at a time against the HAL.
//!
//! ```text
//! SequenceLibrary ──start(id|name)──► SequenceEngine ──HalCall──► Hal
//!                                           │
//!                                           └──CompletionNotice──► subscribers
//! ```

pub mod catalogue;
pub mod engine;
pub mod library;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hal::{
    DomeDirection, HalCall, PatternParam, SERVO_CLOSED_US, SERVO_MAX_US, SERVO_MID_US,
    SERVO_MIN_US, SERVO_OPEN_US,
};

pub use catalogue::SequenceBuilder;
pub use engine::{
    CompletionNotice, CompletionReason, EngineStatus, RunAction, RunState, RunStatus,
    SequenceEngine, TickReport,
};
pub use library::{SequenceDefinition, SequenceLibrary, StepDefinition};

// ============================================================================
// Positions
// ============================================================================

/// Target of one actuator in a step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PositionRepr", into = "PositionRepr")]
pub enum Position {
    /// Explicit pulse width in microseconds (500-2500)
    Pulse(u16),
    /// Fully open
    Open,
    /// Closed
    Closed,
    /// Half open
    Mid,
    /// Stop sending pulses
    NoPulse,
}

impl Position {
    /// Pulse width this position drives, `None` for [`Position::NoPulse`]
    #[must_use]
    pub fn pulse_us(self) -> Option<u16> {
        match self {
            Self::Pulse(us) => Some(us),
            Self::Open => Some(SERVO_OPEN_US),
            Self::Closed => Some(SERVO_CLOSED_US),
            Self::Mid => Some(SERVO_MID_US),
            Self::NoPulse => None,
        }
    }

    /// Whether an explicit pulse lies in the physical servo range
    #[must_use]
    pub fn is_valid(self) -> bool {
        match self {
            Self::Pulse(us) => (SERVO_MIN_US..=SERVO_MAX_US).contains(&us),
            _ => true,
        }
    }

    /// Decode the MarcDuino integer convention (`-1` is no pulse)
    #[must_use]
    pub fn from_marcduino(value: i32) -> Option<Self> {
        match value {
            -1 => Some(Self::NoPulse),
            v => u16::try_from(v).ok().map(Self::from_pulse),
        }
    }

    /// Map a pulse width onto the named position it equals, if any
    #[must_use]
    pub fn from_pulse(us: u16) -> Self {
        match us {
            SERVO_OPEN_US => Self::Open,
            SERVO_CLOSED_US => Self::Closed,
            SERVO_MID_US => Self::Mid,
            other => Self::Pulse(other),
        }
    }
}

/// Serialized form: a pulse width, `-1`, or a position name
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PositionRepr {
    Number(i32),
    Name(String),
}

impl TryFrom<PositionRepr> for Position {
    type Error = String;

    fn try_from(repr: PositionRepr) -> Result<Self, Self::Error> {
        match repr {
            PositionRepr::Number(n) => {
                Self::from_marcduino(n).ok_or_else(|| format!("invalid pulse width {n}"))
            }
            PositionRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "open" => Ok(Self::Open),
                "closed" | "close" => Ok(Self::Closed),
                "mid" => Ok(Self::Mid),
                "release" | "nopulse" | "no_pulse" => Ok(Self::NoPulse),
                _ => Err(format!("unknown position {name:?}")),
            },
        }
    }
}

impl From<Position> for PositionRepr {
    fn from(pos: Position) -> Self {
        match pos {
            Position::Pulse(us) => Self::Number(i32::from(us)),
            Position::Open => Self::Name("open".into()),
            Position::Closed => Self::Name("closed".into()),
            Position::Mid => Self::Name("mid".into()),
            Position::NoPulse => Self::Name("release".into()),
        }
    }
}

// ============================================================================
// Cues
// ============================================================================

/// Non-servo action fired together with a step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cue", rename_all = "snake_case")]
pub enum Cue {
    /// Play a sound
    Sound {
        /// Sound bank
        bank: u8,
        /// Track, `None` for next in bank
        #[serde(default)]
        index: Option<u8>,
    },
    /// Stop all sound
    SoundStop,
    /// Toggle random idle sounds
    SoundRandom {
        /// On or off
        enabled: bool,
    },
    /// Light pattern on holoprojectors or displays
    Light {
        /// Pattern id, e.g. `holo.flash`
        pattern: String,
        /// Pattern parameters
        #[serde(default)]
        params: Vec<PatternParam>,
    },
    /// Rotate the dome
    DomeRotate {
        /// Direction
        direction: DomeDirection,
        /// Speed
        speed: u8,
    },
    /// Stop dome rotation
    DomeStop,
}

impl Cue {
    /// HAL call this cue issues
    #[must_use]
    pub fn to_hal_call(&self) -> HalCall {
        match self {
            Self::Sound { bank, index } => HalCall::SoundPlay {
                bank: *bank,
                index: *index,
            },
            Self::SoundStop => HalCall::SoundStopAll,
            Self::SoundRandom { enabled } => HalCall::SoundRandom { enabled: *enabled },
            Self::Light { pattern, params } => HalCall::LedsSetPattern {
                pattern: pattern.clone(),
                params: params.clone(),
            },
            Self::DomeRotate { direction, speed } => HalCall::DomeRotate {
                direction: *direction,
                speed: *speed,
            },
            Self::DomeStop => HalCall::DomeStop,
        }
    }
}

// ============================================================================
// Steps and sequences
// ============================================================================

/// One scheduled action of a sequence
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceStep {
    /// Offset from the start of the run
    pub offset_ms: u64,
    /// Actuator (1-based servo channel) to position; absent actuators are left alone
    pub actuator_positions: BTreeMap<u8, Position>,
    /// Human label
    pub description: String,
    /// Sound, light and dome actions fired after the servo moves
    pub cues: Vec<Cue>,
    /// Interpolate from the previous positions instead of jumping
    pub ramp: bool,
}

/// A named, ordered list of steps
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequence {
    /// Numeric id (`:SEnn`)
    pub id: u8,
    /// Name (`:SEname`), matched case-insensitively
    pub name: String,
    /// Whether the steps carry sound or light cues
    pub includes_sound_and_light: bool,
    /// Steps in firing order
    pub steps: Vec<SequenceStep>,
}

impl Sequence {
    /// Offset of the last step
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.steps.last().map_or(0, |s| s.offset_ms)
    }

    /// Check offsets, channels, positions and name
    ///
    /// # Errors
    ///
    /// Returns `InvalidSequence` describing the first problem found.
    pub fn validate(&self, max_channel: u8) -> Result<(), EngineError> {
        let invalid = |reason: String| EngineError::InvalidSequence {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() || !self.name.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(invalid("name must be non-empty and alphanumeric".into()));
        }
        if self.name.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("name must not be purely numeric".into()));
        }
        if crate::protocol::SEQUENCE_CONTROL_WORDS
            .iter()
            .any(|w| w.eq_ignore_ascii_case(&self.name))
        {
            return Err(invalid(format!("{} is a reserved control word", self.name)));
        }
        if self.steps.is_empty() {
            return Err(invalid("sequence has no steps".into()));
        }

        let mut previous = 0;
        for (i, step) in self.steps.iter().enumerate() {
            if step.offset_ms < previous {
                return Err(invalid(format!(
                    "step {i} offset {}ms precedes previous offset {previous}ms",
                    step.offset_ms
                )));
            }
            previous = step.offset_ms;

            for (&channel, &position) in &step.actuator_positions {
                if channel == 0 || channel > max_channel {
                    return Err(invalid(format!(
                        "step {i} channel {channel} outside 1-{max_channel}"
                    )));
                }
                if !position.is_valid() {
                    return Err(invalid(format!(
                        "step {i} channel {channel} pulse {position:?} outside {SERVO_MIN_US}-{SERVO_MAX_US}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// How a sequence is named in a start request
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceRef {
    /// Numeric id
    Id(u8),
    /// Name, case-insensitive
    Name(String),
}

impl fmt::Display for SequenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id:02}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Sequence library and engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Control call not valid in the current run state
    #[error("InvalidTransition: cannot {action} while {state}")]
    InvalidTransition {
        /// Requested action
        action: RunAction,
        /// State the run was in
        state: RunState,
    },

    /// No sequence with that id or name
    #[error("UnknownSequence: no sequence {0}")]
    UnknownSequence(SequenceRef),

    /// Sequence failed validation
    #[error("InvalidSequence: {name}: {reason}")]
    InvalidSequence {
        /// Sequence name
        name: String,
        /// What was wrong
        reason: String,
    },

    /// Id or name already registered
    #[error("DuplicateSequence: {0}")]
    DuplicateSequence(String),

    /// Sequence definition file could not be read or parsed
    #[error("SequenceLoad: {}: {reason}", path.display())]
    Load {
        /// File that failed
        path: PathBuf,
        /// Reader or parser error
        reason: String,
    },
}
