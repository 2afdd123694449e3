//! Command session over one byte stream
//!
//! A session owns the frame tokenizer for its stream, so partial frames from
//! one client never mix with another's. Every frame gets exactly one reply
//! line:
//!
//! ```text
//! :OP01\r        ──►  OK\r\n
//! :SE02\r        ──►  OK sequence 02 wave run 1\r\n
//! :OP99\r        ──►  ERR ArgumentError: OP: ...\r\n
//! ```
//!
//! With echo on, the frame text is written back on its own line first.

use std::io;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use sith_core::{FrameOutcome, FrameTokenizer, SithCore};

/// Reply line terminator
pub const LINE_END: &[u8] = b"\r\n";

const READ_BUFFER_SIZE: usize = 8192;

/// Frame counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Frames seen, including rejected ones
    pub frames: u64,
    /// Frames that dispatched successfully
    pub ok: u64,
    /// Frames rejected or failed
    pub errors: u64,
}

impl SessionStats {
    fn record(&mut self, outcome: &FrameOutcome) {
        self.frames += 1;
        if outcome.is_success() {
            self.ok += 1;
        } else {
            self.errors += 1;
        }
    }
}

/// One client stream bound to the shared core
pub struct Session<S> {
    core: Arc<SithCore>,
    stream: S,
    tokenizer: FrameTokenizer,
    echo: bool,
    stats: SessionStats,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Bind `stream` to `core`
    pub fn new(core: Arc<SithCore>, stream: S, echo: bool) -> Self {
        Self {
            core,
            stream,
            tokenizer: FrameTokenizer::new(),
            echo,
            stats: SessionStats::default(),
        }
    }

    /// Serve the stream until EOF
    ///
    /// # Errors
    ///
    /// Read or write failures on the stream. Protocol errors never end the
    /// session; they are answered with an `ERR` line.
    pub async fn run(mut self) -> io::Result<SessionStats> {
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = self.stream.read(&mut read_buf).await?;
            if n == 0 {
                info!(
                    frames = self.stats.frames,
                    errors = self.stats.errors,
                    "Client disconnected (EOF)"
                );
                break;
            }
            self.handle_bytes(&read_buf[..n]).await?;
        }
        Ok(self.stats)
    }

    async fn handle_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tokenizer.push(bytes);
        while let Some(frame) = self.tokenizer.next_frame() {
            let outcome = match frame {
                Ok(frame) => {
                    if self.echo {
                        self.stream.write_all(&frame).await?;
                        self.stream.write_all(LINE_END).await?;
                    }
                    self.core.handle_frame(&frame)
                }
                Err(error) => FrameOutcome::Rejected { error },
            };
            self.stats.record(&outcome);

            let reply = outcome.reply();
            debug!(reply = %reply, "Replying");
            self.stream.write_all(reply.as_bytes()).await?;
            self.stream.write_all(LINE_END).await?;
        }
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sith_core::{HalCall, LoggerBackend, SERVO_OPEN_US};
    use tokio_test::io::Builder;

    fn core() -> (Arc<LoggerBackend>, Arc<SithCore>) {
        let hal = Arc::new(LoggerBackend::new());
        let core = Arc::new(SithCore::with_hal(hal.clone()));
        (hal, core)
    }

    #[tokio::test]
    async fn test_replies_ok_per_frame() {
        let (hal, core) = core();
        let stream = Builder::new()
            .read(b":OP01\r:CL")
            .write(b"OK\r\n")
            .read(b"01\r")
            .write(b"OK\r\n")
            .build();

        let stats = Session::new(core, stream, false).run().await.unwrap();
        assert_eq!(
            stats,
            SessionStats {
                frames: 2,
                ok: 2,
                errors: 0
            }
        );
        assert_eq!(
            hal.calls()[0],
            HalCall::ServoSetPosition {
                channel: 1,
                pulse_us: SERVO_OPEN_US
            }
        );
    }

    #[tokio::test]
    async fn test_errors_do_not_end_session() {
        let (_hal, core) = core();
        let stream = Builder::new()
            .read(b"?\r:SESTOP\r:OP02\r")
            .write(b"ERR MalformedCommand: unknown start character '?'\r\n")
            .write(b"ERR InvalidTransition: cannot stop while idle\r\n")
            .write(b"OK\r\n")
            .build();

        let stats = Session::new(core, stream, false).run().await.unwrap();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.errors, 2);
    }

    #[tokio::test]
    async fn test_echo_precedes_reply() {
        let (_hal, core) = core();
        let stream = Builder::new()
            .read(b":HD03\r")
            .write(b":HD03\r\n")
            .write(b"OK\r\n")
            .build();

        let stats = Session::new(core, stream, true).run().await.unwrap();
        assert_eq!(stats.ok, 1);
    }

    #[tokio::test]
    async fn test_sequence_reply_carries_message() {
        let (_hal, core) = core();
        let stream = Builder::new()
            .read(b":SE02\r")
            .write(b"OK sequence 02 wave run 1\r\n")
            .build();

        Session::new(Arc::clone(&core), stream, false)
            .run()
            .await
            .unwrap();
        assert_eq!(
            core.engine().status().run.map(|r| r.sequence_id),
            Some(2)
        );
    }
}
