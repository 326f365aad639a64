//! Local subprocess transport over a pseudo-terminal.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::ChannelError;

use super::io::ChannelIO;

/// Granularity of the wait-for-data poll loop; between slices the child is
/// checked for unexpected exit.
const MIN_READ_WAIT: Duration = Duration::from_millis(300);

/// How long a terminated child gets to exit before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(3);

/// A local subprocess speaking through a pty master.
pub struct PtyChannelIO {
    master: OwnedFd,
    child: Child,
    closed: bool,
}

impl PtyChannelIO {
    /// Spawn `program` in its own session on a fresh pty.
    pub fn spawn(
        program: &str,
        args: &[&str],
        columns: u16,
        lines: u16,
    ) -> Result<Self, ChannelError> {
        let winsize = Winsize {
            ws_row: lines,
            ws_col: columns,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None).map_err(io::Error::from)?;

        let stdin = pty.slave.try_clone().map_err(ChannelError::Io)?;
        let stdout = pty.slave.try_clone().map_err(ChannelError::Io)?;
        let stderr = pty.slave;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env("TERM", "xterm-256color");
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(|| {
                // New session with the pty slave as controlling terminal.
                nix::unistd::setsid().map_err(io::Error::from)?;
                if unsafe { libc::ioctl(0, libc::TIOCSCTTY, 0) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn().map_err(ChannelError::Io)?;
        debug!("spawned {program:?} (pid {}) on a pty", child.id());

        fcntl::fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(io::Error::from)?;

        Ok(Self {
            master: pty.master,
            child,
            closed: false,
        })
    }

    /// An interactive bash with user configuration suppressed.
    pub fn local_bash(columns: u16, lines: u16) -> Result<Self, ChannelError> {
        Self::spawn(
            "bash",
            &["--norc", "--noprofile", "--noediting", "-i"],
            columns,
            lines,
        )
    }

    fn child_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Wait until the master fd reports `events`, in slices so a dead child
    /// is noticed promptly. Returns false on deadline.
    fn wait_ready(
        &mut self,
        events: PollFlags,
        timeout: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slice = match deadline {
                None => MIN_READ_WAIT,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(false);
                    }
                    (d - now).min(MIN_READ_WAIT)
                }
            };
            let mut fds = [PollFd::new(self.master.as_fd(), events)];
            let millis = u16::try_from(slice.as_millis()).unwrap_or(u16::MAX);
            let n = poll(&mut fds, PollTimeout::from(millis)).map_err(io::Error::from)?;
            if n > 0 {
                return Ok(true);
            }
            if self.child_exited() {
                // One last non-blocking check: the child may have written
                // right before exiting.
                let mut fds = [PollFd::new(self.master.as_fd(), events)];
                let n = poll(&mut fds, PollTimeout::ZERO).map_err(io::Error::from)?;
                if n > 0 {
                    return Ok(true);
                }
                self.closed = true;
                return Err(ChannelError::Closed);
            }
        }
    }
}

impl ChannelIO for PtyChannelIO {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if !self.wait_ready(PollFlags::POLLOUT, Some(Duration::from_secs(10)))? {
            return Err(ChannelError::Timeout(Duration::from_secs(10)));
        }
        let n = nix::unistd::write(self.master.as_fd(), buf).map_err(io::Error::from)?;
        Ok(n)
    }

    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if !self.wait_ready(PollFlags::POLLIN, timeout)? {
            return Err(ChannelError::Timeout(timeout.unwrap_or_default()));
        }
        let mut buf = vec![0u8; max];
        match nix::unistd::read(self.master.as_raw_fd(), &mut buf) {
            Ok(0) => {
                self.closed = true;
                Err(ChannelError::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            // A pty master raises EIO once the slave side is gone.
            Err(nix::errno::Errno::EIO) => {
                self.closed = true;
                Err(ChannelError::Closed)
            }
            Err(e) => Err(ChannelError::Io(io::Error::from(e))),
        }
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.closed = true;

        if !self.child_exited() {
            let pid = Pid::from_raw(self.child.id() as i32);
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                warn!("failed to terminate pty child {pid}: {e}");
            }
            let deadline = Instant::now() + TERM_GRACE;
            while Instant::now() < deadline && !self.child_exited() {
                std::thread::sleep(Duration::from_millis(50));
            }
            if !self.child_exited() {
                warn!("pty child {pid} ignored SIGTERM, killing");
                let _ = kill(pid, Signal::SIGKILL);
                let _ = self.child.wait();
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn resize(&mut self, columns: u16, lines: u16) -> Result<(), ChannelError> {
        let ws = libc::winsize {
            ws_row: lines,
            ws_col: columns,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(ChannelError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn identity(&self) -> Option<RawFd> {
        Some(self.master.as_raw_fd())
    }
}

impl Drop for PtyChannelIO {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("failed to close pty transport on drop: {e}");
            }
        }
    }
}
