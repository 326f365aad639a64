//! SSH transport backed by libssh2.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use log::debug;
use secrecy::{ExposeSecret, SecretString};
use ssh2::Session;

use crate::error::ChannelError;

use super::io::ChannelIO;

/// Stand-in for "wait forever"; re-armed until data arrives.
const POLL_SLICE: Duration = Duration::from_secs(60);

/// How an SSH connection authenticates.
pub enum SshAuth<'a> {
    Password(&'a SecretString),
    KeyFile(&'a Path),
    Agent,
}

/// An interactive shell session on a remote host.
pub struct SshChannelIO {
    session: Session,
    channel: ssh2::Channel,
    fd: RawFd,
    closed: bool,
}

impl SshChannelIO {
    /// Connect, authenticate and open a pty-backed remote shell.
    pub fn connect(
        host: &str,
        port: u16,
        user: &str,
        auth: SshAuth<'_>,
        columns: u16,
        lines: u16,
    ) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect((host, port)).map_err(ChannelError::Io)?;
        let fd = stream.as_raw_fd();

        let mut session = Session::new().map_err(io::Error::from)?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(io::Error::from)?;

        match auth {
            SshAuth::Password(password) => session
                .userauth_password(user, password.expose_secret())
                .map_err(io::Error::from)?,
            SshAuth::KeyFile(key) => session
                .userauth_pubkey_file(user, None, key, None)
                .map_err(io::Error::from)?,
            SshAuth::Agent => session.userauth_agent(user).map_err(io::Error::from)?,
        }
        debug!("authenticated to {user}@{host}:{port}");

        let mut channel = session.channel_session().map_err(io::Error::from)?;
        channel
            .request_pty(
                "xterm-256color",
                None,
                Some((columns.into(), lines.into(), 0, 0)),
            )
            .map_err(io::Error::from)?;
        channel.shell().map_err(io::Error::from)?;

        Ok(Self {
            session,
            channel,
            fd,
            closed: false,
        })
    }
}

impl ChannelIO for SshChannelIO {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.session.set_timeout(10_000);
        let n = self.channel.write(buf).map_err(ChannelError::Io)?;
        Ok(n)
    }

    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let mut buf = vec![0u8; max];
        let mut waited = Duration::ZERO;
        loop {
            let slice = match timeout {
                None => POLL_SLICE,
                Some(t) => {
                    if waited >= t {
                        return Err(ChannelError::Timeout(t));
                    }
                    (t - waited).min(POLL_SLICE)
                }
            };
            self.session
                .set_timeout(u32::try_from(slice.as_millis()).unwrap_or(u32::MAX));
            match self.channel.read(&mut buf) {
                Ok(0) => {
                    self.closed = true;
                    return Err(ChannelError::Closed);
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    waited += slice;
                }
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.closed = true;
        self.session.set_timeout(3_000);
        self.channel.close().map_err(io::Error::from)?;
        if let Err(e) = self.channel.wait_close() {
            debug!("remote side did not acknowledge channel close: {e}");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed || self.channel.eof()
    }

    fn resize(&mut self, columns: u16, lines: u16) -> Result<(), ChannelError> {
        self.channel
            .request_pty_size(columns.into(), lines.into(), None, None)
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn identity(&self) -> Option<RawFd> {
        Some(self.fd)
    }
}
