//! The raw transport capability a [`Channel`](super::Channel) is built on.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::ChannelError;

/// How many bytes a single read attempt asks the transport for.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Minimal raw transport contract.
///
/// Implementations must raise [`ChannelError::Closed`] on a dead transport
/// instead of silently returning empty data, and must fail reads with
/// [`ChannelError::Timeout`] distinctly from closure when no data arrives
/// within the deadline.
pub trait ChannelIO {
    /// Write as much of `buf` as the transport accepts, returning the number
    /// of bytes written.
    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError>;

    /// Read up to `max` bytes. Suspends up to `timeout` waiting for the first
    /// byte (forever if `None`), then returns whatever is immediately
    /// available, which may be fewer than `max` bytes.
    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>, ChannelError>;

    /// Close the transport. Closing an already closed transport is an error.
    fn close(&mut self) -> Result<(), ChannelError>;

    /// Whether the transport has ended.
    fn is_closed(&self) -> bool;

    /// Best-effort resize of the remote terminal. No-op where unsupported.
    fn resize(&mut self, _columns: u16, _lines: u16) -> Result<(), ChannelError> {
        Ok(())
    }

    /// A pollable handle for this transport, if it has one.
    fn identity(&self) -> Option<RawFd> {
        None
    }

    /// Write the whole of `buf`, looping over short writes.
    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), ChannelError> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(ChannelError::Closed);
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// A transport that carries no data at all.
///
/// Used as a placeholder for machines which have not connected yet and in
/// tests that only exercise lifecycle logic.
#[derive(Debug, Default)]
pub struct NullChannelIO {
    closed: bool,
}

impl NullChannelIO {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelIO for NullChannelIO {
    fn write(&mut self, _buf: &[u8]) -> Result<usize, ChannelError> {
        Err(ChannelError::Io(io::Error::other(
            "cannot write to a null channel",
        )))
    }

    fn read(&mut self, _max: usize, _timeout: Option<Duration>) -> Result<Vec<u8>, ChannelError> {
        Err(ChannelError::Io(io::Error::other(
            "cannot read from a null channel",
        )))
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_channel_refuses_io() {
        let mut io = NullChannelIO::new();
        assert!(io.write(b"x").is_err());
        assert!(io.read(16, None).is_err());
    }

    #[test]
    fn test_null_channel_close_once() {
        let mut io = NullChannelIO::new();
        assert!(!io.is_closed());
        io.close().unwrap();
        assert!(io.is_closed());
        assert!(matches!(io.close(), Err(ChannelError::Closed)));
    }
}
