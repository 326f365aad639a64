//! Interaction with a long-running foreground command.

use std::time::Duration;

use log::{debug, warn};

use crate::channel::{BoundedPattern, ExpectMatch};
use crate::error::{Result, ShellError};

use super::ShellSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    /// The command is in the foreground; I/O goes to it.
    Running,
    /// Waiting for the command to finish and the prompt to return.
    Terminating,
    /// Exit code collected, the shell is back at its prompt.
    Ended,
}

/// A foreground command started by [`ShellSession::run`].
///
/// While the proxy exists, channel I/O talks to the command, not the shell.
/// [`terminate`](Self::terminate) waits for the command to finish and
/// restores the shell; a proxy dropped without terminating leaves the shell
/// in an undefined state and logs a warning.
pub struct CommandProxy<'a> {
    shell: &'a ShellSession,
    cmd: String,
    state: ProxyState,
}

impl<'a> CommandProxy<'a> {
    pub(super) fn new(shell: &'a ShellSession, cmd: &str) -> Self {
        Self {
            shell,
            cmd: cmd.to_string(),
            state: ProxyState::Running,
        }
    }

    /// The command line this proxy runs.
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    fn assert_running(&self) {
        assert_eq!(
            self.state,
            ProxyState::Running,
            "proxy for {:?} used after termination",
            self.cmd
        );
    }

    /// Wait for a pattern in the command's output.
    pub fn expect(
        &self,
        patterns: &[BoundedPattern],
        timeout: Option<Duration>,
    ) -> Result<ExpectMatch> {
        self.assert_running();
        self.shell.channel().expect(patterns, timeout)
    }

    /// Read raw output from the command.
    pub fn read(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.assert_running();
        self.shell.channel().read(max, timeout)
    }

    /// Read one line of command output.
    pub fn readline(&self, timeout: Option<Duration>) -> Result<String> {
        self.assert_running();
        self.shell.channel().readline(timeout)
    }

    /// Send a line to the command's stdin.
    pub fn sendline(&self, text: impl AsRef<[u8]>) -> Result<()> {
        self.assert_running();
        self.shell.channel().sendline(text, false)
    }

    /// Send a control byte to the command, e.g. `sendcontrol('c')`.
    pub fn sendcontrol(&self, letter: char) -> Result<()> {
        self.assert_running();
        self.shell.channel().sendcontrol(letter)
    }

    /// Send the interrupt character to the command.
    pub fn sendintr(&self) -> Result<()> {
        self.assert_running();
        self.shell.channel().sendintr()
    }

    /// Wait for the command to finish; returns its exit code and the output
    /// produced since the last read.
    pub fn terminate(mut self) -> Result<(i32, String)> {
        assert_ne!(
            self.state,
            ProxyState::Ended,
            "proxy for {:?} terminated twice",
            self.cmd
        );
        self.state = ProxyState::Terminating;
        let out = self.shell.channel().read_until_prompt(None, None)?;
        let code = self.shell.fetch_retcode()?;
        debug!("[{}] {:?} exited with {code}", self.shell.name(), self.cmd);
        self.state = ProxyState::Ended;
        Ok((code, out))
    }

    /// Like [`terminate`](Self::terminate), but a non-zero exit code fails
    /// with [`ShellError::CommandFailure`].
    pub fn terminate0(self) -> Result<String> {
        let cmd = self.cmd.clone();
        let (code, out) = self.terminate()?;
        if code != 0 {
            return Err(ShellError::CommandFailure { cmd, out }.into());
        }
        Ok(out)
    }
}

impl Drop for CommandProxy<'_> {
    fn drop(&mut self) {
        if self.state != ProxyState::Ended {
            warn!(
                "proxy for {:?} dropped without terminating, shell state is undefined",
                self.cmd
            );
        }
    }
}
