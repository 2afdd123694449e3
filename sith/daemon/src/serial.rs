//! Serial transport
//!
//! Opens a serial device or pseudo-terminal, switches it to raw 8N1 at the
//! configured baud rate and hands it to a [`Session`](crate::session::Session)
//! like any other stream.
//!
//! The line is non-blocking and driven by the reactor through [`AsyncFd`].
//! An idle read holds no thread, so dropping the session on shutdown
//! releases the device at once.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::info;

/// Serial setup failures
#[derive(Debug, Error)]
pub enum SerialError {
    /// No termios constant for this rate
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),

    /// Device could not be opened
    #[error("failed to open serial device {path:?}: {source}")]
    Open {
        /// Device path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Line discipline could not be set (not a tty?)
    #[error("failed to configure serial device {path:?}: {source}")]
    Configure {
        /// Device path
        path: PathBuf,
        /// Underlying errno
        #[source]
        source: nix::errno::Errno,
    },

    /// Device could not be registered with the reactor
    #[error("failed to watch serial device {path:?}: {source}")]
    Register {
        /// Device path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// An open serial line
#[derive(Debug)]
pub struct SerialPort {
    fd: AsyncFd<File>,
}

impl AsyncRead for SerialPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;

            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    // Writes go straight to the tty driver
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Termios constant for `baud`
///
/// # Errors
///
/// `UnsupportedBaud` for rates the line discipline has no constant for.
pub fn baud_rate(baud: u32) -> Result<BaudRate, SerialError> {
    let rate = match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        other => return Err(SerialError::UnsupportedBaud(other)),
    };
    Ok(rate)
}

/// Open `path` as a raw serial line at `baud`
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Unsupported baud rate, open failure, termios failure or reactor
/// registration failure.
pub fn open_serial(path: &Path, baud: u32) -> Result<SerialPort, SerialError> {
    let rate = baud_rate(baud)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| SerialError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let configure = |source| SerialError::Configure {
        path: path.to_path_buf(),
        source,
    };
    let mut settings = termios::tcgetattr(&file).map_err(configure)?;
    termios::cfmakeraw(&mut settings);
    termios::cfsetspeed(&mut settings, rate).map_err(configure)?;
    settings.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    termios::tcsetattr(&file, SetArg::TCSANOW, &settings).map_err(configure)?;

    let fd = AsyncFd::new(file).map_err(|source| SerialError::Register {
        path: path.to_path_buf(),
        source,
    })?;
    info!(device = ?path, baud, "Serial device configured");
    Ok(SerialPort { fd })
}
