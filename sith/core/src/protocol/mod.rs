//! Shadow/MarcDuino wire protocol
//!
//! ```text
//! bytes ──► FrameTokenizer ──► frame ──► decode() ──► Command
//!                                                       │
//!                                 Command::encode() ◄───┘
//! ```
//!
//! # Wire Grammar
//!
//! ```text
//! frame      := start-char opcode-body CR
//! start-char := ':' | '*' | '@' | '$' | '#' | '&' | '!' | '%'
//! CR         := 0x0D
//! ```
//!
//! Every error here is recoverable: the frame is dropped and processing
//! continues with the next one.

pub mod command;
pub mod decoder;
pub mod tokenizer;

pub use command::{
    Argument, Command, Family, NamedSound, Opcode, Target, VolumeStep, DISPLAY_COUNT, HOLO_COUNT,
    MAX_I2C_ADDRESS, PANEL_COUNT,
};
pub use decoder::{decode, MAX_SLAVE_DELAY_MS, SEQUENCE_CONTROL_WORDS};
pub use tokenizer::{FrameTokenizer, FRAME_TERMINATOR, MAX_FRAME_LEN};

use thiserror::Error;

/// Decode-time errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame grew past the maximum length and was discarded
    #[error("FrameTooLong: frame of {len}+ bytes exceeds maximum of {max}")]
    FrameTooLong {
        /// Bytes seen when the frame was dropped
        len: usize,
        /// Maximum accepted frame length
        max: usize,
    },

    /// Empty frame, unknown start character or non-ASCII content
    #[error("MalformedCommand: {reason}")]
    MalformedCommand {
        /// What was wrong with the frame
        reason: String,
    },

    /// Family recognised, opcode not
    #[error("UnknownOpcode: {family} has no opcode {opcode:?}")]
    UnknownOpcode {
        /// Family from the start character
        family: Family,
        /// Offending opcode text
        opcode: String,
    },

    /// Wrong count, type or range of arguments for the opcode
    #[error("ArgumentError: {opcode}: {reason}")]
    ArgumentError {
        /// Opcode mnemonic
        opcode: &'static str,
        /// What was wrong with the arguments
        reason: String,
    },
}
