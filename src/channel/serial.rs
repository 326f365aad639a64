//! Serial console transport.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use log::debug;
use serialport::{SerialPort, TTYPort};

use crate::error::ChannelError;

use super::io::ChannelIO;

/// Stand-in for "wait forever"; re-armed until data arrives.
const POLL_SLICE: Duration = Duration::from_secs(60);

/// A local serial device, typically a board console.
pub struct SerialChannelIO {
    port: Option<TTYPort>,
    path: String,
}

impl SerialChannelIO {
    /// Open `path` at `baud`, 8N1.
    pub fn open(path: &str, baud: u32) -> Result<Self, ChannelError> {
        let port = serialport::new(path, baud)
            .timeout(POLL_SLICE)
            .open_native()
            .map_err(|e| ChannelError::Io(io::Error::other(e)))?;
        debug!("opened serial console {path} at {baud} baud");
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
        })
    }

    fn port(&mut self) -> Result<&mut TTYPort, ChannelError> {
        self.port.as_mut().ok_or(ChannelError::Closed)
    }
}

impl ChannelIO for SerialChannelIO {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        let n = self.port()?.write(buf).map_err(ChannelError::Io)?;
        Ok(n)
    }

    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>, ChannelError> {
        let port = self.port.as_mut().ok_or(ChannelError::Closed)?;
        let mut buf = vec![0u8; max];

        // Block for the first byte, then drain whatever else is pending.
        let mut waited = Duration::ZERO;
        let n = loop {
            let slice = match timeout {
                None => POLL_SLICE,
                Some(t) => {
                    if waited >= t {
                        return Err(ChannelError::Timeout(t));
                    }
                    (t - waited).min(POLL_SLICE)
                }
            };
            port.set_timeout(slice)
                .map_err(|e| ChannelError::Io(io::Error::other(e)))?;
            match port.read(&mut buf) {
                Ok(0) => {
                    self.port = None;
                    return Err(ChannelError::Closed);
                }
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => waited += slice,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ChannelError::Io(e)),
            }
        };

        let pending = port.bytes_to_read().unwrap_or(0) as usize;
        let extra = pending.min(max - n);
        let mut total = n;
        if extra > 0 {
            port.set_timeout(Duration::from_millis(1))
                .map_err(|e| ChannelError::Io(io::Error::other(e)))?;
            if let Ok(m) = port.read(&mut buf[n..n + extra]) {
                total += m;
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if self.port.take().is_none() {
            return Err(ChannelError::Closed);
        }
        debug!("closed serial console {}", self.path);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.port.is_none()
    }

    fn identity(&self) -> Option<RawFd> {
        self.port.as_ref().map(|p| p.as_raw_fd())
    }
}
