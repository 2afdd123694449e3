//! Command Tokenizer
//!
//! Splits an unbounded byte stream into carriage-return terminated frames.
//!
//! # Frame Format
//!
//! ```text
//! +------------+------------------------------+------+
//! | start (1)  | opcode body (variable)       | 0x0D |
//! +------------+------------------------------+------+
//!  <----------- at most MAX_FRAME_LEN ------->
//! ```
//!
//! Bytes arrive in arbitrary chunks from a serial port, pseudo-terminal or
//! socket. Incomplete frames are buffered across reads. A frame that grows past
//! [`MAX_FRAME_LEN`] is discarded and reported once as
//! [`ProtocolError::FrameTooLong`]; everything up to the next terminator is
//! dropped and tokenization resumes after it.
//!
//! A tokenizer holds no command semantics and is created per connection.

use std::collections::VecDeque;

use super::ProtocolError;

/// Maximum frame length in bytes, excluding the terminator
pub const MAX_FRAME_LEN: usize = 32;

/// Frame terminator (carriage return)
pub const FRAME_TERMINATOR: u8 = b'\r';

/// Line feed, ignored when it directly follows a terminator
const LINE_FEED: u8 = b'\n';

/// Streaming frame tokenizer
///
/// Feed bytes with [`push`](Self::push) and pull frames with
/// [`next_frame`](Self::next_frame).
#[derive(Debug, Default)]
pub struct FrameTokenizer {
    /// Bytes of the frame currently being assembled
    buffer: Vec<u8>,
    /// Completed frames and errors waiting to be pulled
    ready: VecDeque<Result<Vec<u8>, ProtocolError>>,
    /// Dropping bytes until the next terminator
    discarding: bool,
    /// Previous byte was a terminator
    after_terminator: bool,
}

impl FrameTokenizer {
    /// Create a new tokenizer with an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_LEN),
            ..Self::default()
        }
    }

    /// Append bytes read from the transport
    pub fn push(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == FRAME_TERMINATOR {
                self.finish_frame();
                self.after_terminator = true;
                continue;
            }

            // CRLF terminals: swallow the LF of the pair
            if byte == LINE_FEED && self.after_terminator {
                self.after_terminator = false;
                continue;
            }
            self.after_terminator = false;

            if self.discarding {
                continue;
            }

            self.buffer.push(byte);
            if self.buffer.len() > MAX_FRAME_LEN {
                let len = self.buffer.len();
                self.buffer.clear();
                self.discarding = true;
                tracing::warn!(len, max = MAX_FRAME_LEN, "Frame too long, resynchronizing");
                self.ready.push_back(Err(ProtocolError::FrameTooLong {
                    len,
                    max: MAX_FRAME_LEN,
                }));
            }
        }
    }

    /// Pull the next complete frame, or the next tokenization error
    ///
    /// Returns:
    /// - `Some(Ok(frame))` for a complete frame (terminator stripped)
    /// - `Some(Err(ProtocolError::FrameTooLong))` once per oversize frame
    /// - `None` if more data is needed
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, ProtocolError>> {
        self.ready.pop_front()
    }

    /// Drain every frame currently available
    pub fn frames(&mut self) -> impl Iterator<Item = Result<Vec<u8>, ProtocolError>> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    /// Number of bytes buffered for the incomplete frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered state (e.g. on reconnect)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.ready.clear();
        self.discarding = false;
        self.after_terminator = false;
    }

    fn finish_frame(&mut self) {
        if self.discarding {
            // Oversize frame was already reported
            self.discarding = false;
            return;
        }
        if self.buffer.is_empty() {
            return;
        }
        let frame = std::mem::replace(&mut self.buffer, Vec::with_capacity(MAX_FRAME_LEN));
        self.ready.push_back(Ok(frame));
    }
}
