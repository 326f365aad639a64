//! Interactive terminal attach.
//!
//! Bridges the local terminal and a channel byte-for-byte: keystrokes go to
//! the transport unfiltered, transport output goes to the local screen. The
//! local terminal is switched to raw mode for the duration and always
//! restored, even on error.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use bytes::BytesMut;
use log::debug;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::isatty;

use crate::error::{ChannelError, Result};

use super::pattern::BoundedPattern;
use super::{Channel, READ_CHUNK_SIZE};

/// EOT, the byte Ctrl-D produces.
const CTRL_D: u8 = 0x04;

/// Restores the saved terminal attributes on drop.
struct RawModeGuard {
    fd: RawFd,
    saved: Termios,
}

impl RawModeGuard {
    fn enter(fd: RawFd) -> io::Result<Self> {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        let saved = termios::tcgetattr(bfd)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(bfd, SetArg::TCSADRAIN, &raw)?;
        Ok(Self { fd, saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let bfd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let _ = termios::tcsetattr(bfd, SetArg::TCSADRAIN, &self.saved);
    }
}

/// The local terminal size in (columns, lines), with an 80x24 fallback.
pub(crate) fn local_termsize() -> (u16, u16) {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        (ws.ws_col, ws.ws_row)
    } else {
        (80, 24)
    }
}

impl Channel {
    /// Attach the local terminal to this channel until the session ends.
    ///
    /// Ends when `end_magic` appears in the transport output, when the user
    /// presses Ctrl-D (if `ctrld_exit` is set; the byte is not forwarded), or
    /// when the transport closes. Requires a pollable transport.
    pub fn attach_interactive(
        &self,
        end_magic: Option<&BoundedPattern>,
        ctrld_exit: bool,
    ) -> Result<()> {
        self.check_access()?;
        let chan_fd = self
            .inner
            .borrow()
            .io
            .identity()
            .ok_or(ChannelError::Unsupported(
                "interactive attach requires a pollable transport",
            ))?;

        let stdin = io::stdin();
        let stdin_fd = stdin.as_fd().as_raw_fd();
        let _raw = if isatty(stdin_fd).unwrap_or(false) {
            Some(RawModeGuard::enter(stdin_fd).map_err(ChannelError::Io)?)
        } else {
            None
        };

        let mut stdout = io::stdout();
        // Rolling tail of transport output, long enough that the end magic
        // can never straddle out of it.
        let window_cap = end_magic.map(|p| p.max_len() * 2).unwrap_or(0);
        let mut window = BytesMut::with_capacity(window_cap);
        let mut keys = [0u8; 256];

        debug!("interactive attach started");
        loop {
            let chan_bfd = unsafe { BorrowedFd::borrow_raw(chan_fd) };
            let stdin_bfd = unsafe { BorrowedFd::borrow_raw(stdin_fd) };
            let mut fds = [
                PollFd::new(chan_bfd, PollFlags::POLLIN),
                PollFd::new(stdin_bfd, PollFlags::POLLIN),
            ];
            poll(&mut fds, PollTimeout::from(100u16))
                .map_err(|e| ChannelError::Io(e.into()))?;
            let chan_ready = fds[0].revents().is_some_and(|r| !r.is_empty());
            let stdin_ready = fds[1].revents().is_some_and(|r| !r.is_empty());

            if chan_ready {
                let chunk = {
                    let mut inner = self.inner.borrow_mut();
                    match inner.io.read(READ_CHUNK_SIZE, Some(Duration::from_millis(10))) {
                        Ok(chunk) => chunk,
                        Err(ChannelError::Timeout(_)) => Vec::new(),
                        Err(ChannelError::Closed) => break,
                        Err(e) => return Err(e.into()),
                    }
                };
                if !chunk.is_empty() {
                    stdout.write_all(&chunk).map_err(ChannelError::Io)?;
                    stdout.flush().map_err(ChannelError::Io)?;
                    if let Some(magic) = end_magic {
                        window.extend_from_slice(&chunk);
                        if magic.find(&window).is_some() {
                            debug!("interactive attach ended by magic marker");
                            break;
                        }
                        if window.len() > magic.max_len() {
                            let excess = window.len() - magic.max_len();
                            let _ = window.split_to(excess);
                        }
                    }
                }
            }

            if stdin_ready {
                let n = stdin.lock().read(&mut keys).map_err(ChannelError::Io)?;
                if n == 0 {
                    break;
                }
                let pressed = &keys[..n];
                if ctrld_exit {
                    if let Some(pos) = pressed.iter().position(|&b| b == CTRL_D) {
                        if pos > 0 {
                            self.inner.borrow_mut().io.write_all(&pressed[..pos])?;
                        }
                        debug!("interactive attach ended by Ctrl-D");
                        break;
                    }
                }
                self.inner.borrow_mut().io.write_all(pressed)?;
            }

            if self.inner.borrow().io.is_closed() {
                break;
            }
        }
        Ok(())
    }
}
