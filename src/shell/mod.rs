//! Robust shell access over a channel.
//!
//! [`ShellSession::setup`] turns a channel that has *some* POSIX shell on the
//! other end into a deterministic one: it waits for the shell to answer, sets
//! a collision-free prompt, disables history and line editing, pins the
//! terminal size and sanity-checks the result. Every step is phrased so the
//! terminal echo of a command can never be mistaken for the command's output.

mod proxy;

pub use proxy::CommandProxy;

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use log::{debug, info, warn};

use crate::channel::{BoundedPattern, Channel};
use crate::error::{Result, ShellError};

/// The prompt configured on every managed shell. Deliberately improbable so
/// it never occurs in ordinary command output.
pub const SHELL_PROMPT: &[u8] = b"TESTRIG-VC9QK$ ";

/// Handshake probe. The `\L` survives as plain `L` in the output but keeps
/// the echoed command line from matching the marker.
const HANDSHAKE_PROBE: &str = "echo RBOT\\LOGIN";
const HANDSHAKE_MARKER: &str = "RBOTLOGIN";

/// First probe deadline; a live shell answers almost instantly.
const HANDSHAKE_SHORT: Duration = Duration::from_millis(200);
/// Retry deadline once the shell has proven slow.
const HANDSHAKE_LONG: Duration = Duration::from_secs(3);

/// Terminal geometry pinned during setup.
const SETUP_COLUMNS: u16 = 80;
const SETUP_LINES: u16 = 24;

const SANITY_TOKEN: &str = "TESTRIG-SANITY-CHECK";

/// Quote `text` so a POSIX shell passes it through as one literal word.
pub fn quote(text: &str) -> String {
    if !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':'))
    {
        return text.to_string();
    }
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for c in text.chars() {
        if c == '\'' {
            quoted.push_str(r"'\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote every argument and join with spaces.
pub fn join(args: &[&str]) -> String {
    args.iter()
        .map(|a| quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split `text` for an `echo` command so the echoed command line can never
/// match `text` itself, while the output still does.
fn mangle_echo(text: &str) -> String {
    let mid = text.len() / 2;
    format!("echo {}''{}", &text[..mid], &text[mid..])
}

/// Probe the channel until a shell answers.
///
/// Sends an echo probe and waits briefly; a shell that is still booting gets
/// re-probed with an escalated deadline for as long as it takes. A board can
/// boot for minutes, so only a channel failure ends the loop. This is the
/// only place where commands are auto-retried, and it is safe here because a
/// repeated `echo` has no side effects.
pub fn wait_for_shell(ch: &Channel) -> Result<()> {
    let marker = [BoundedPattern::literal(HANDSHAKE_MARKER)];
    let mut timeout = HANDSHAKE_SHORT;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        ch.sendline(HANDSHAKE_PROBE, false)?;
        match ch.expect(&marker, Some(timeout)) {
            Ok(_) => {
                debug!("shell answered handshake on attempt {attempt}");
                return Ok(());
            }
            Err(e) if e.is_timeout() => {
                debug!("handshake attempt {attempt} timed out, re-probing");
                timeout = HANDSHAKE_LONG;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A channel with a configured, deterministic shell on the far end.
pub struct ShellSession {
    ch: Channel,
    name: String,
}

impl ShellSession {
    /// Take over a channel and configure the shell behind it.
    pub fn setup(ch: Channel, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        info!("initializing shell on {name}");

        wait_for_shell(&ch)?;

        // Set the prompt. The assignment is split mid-word so the echoed
        // command line cannot match the prompt pattern; only the freshly
        // printed prompt can.
        let prompt_str = String::from_utf8_lossy(SHELL_PROMPT);
        let mid = 6;
        ch.sendline(
            format!("PS1='{}''{}'", &prompt_str[..mid], &prompt_str[mid..]),
            false,
        )?;
        ch.expect(
            &[BoundedPattern::literal(SHELL_PROMPT)],
            Some(HANDSHAKE_LONG),
        )?;
        ch.set_prompt(Some(BoundedPattern::literal(SHELL_PROMPT)))?;

        let shell = Self { ch, name };

        // From here on commands run through the ordinary echo-synchronized
        // path. Make the shell deterministic: no history, no line editing,
        // no continuation prompt, fixed geometry.
        for cmd in [
            "unset HISTFILE",
            "set +o emacs; set +o vi",
            "PS2=''; histchars=''",
            &format!("stty cols {SETUP_COLUMNS} rows {SETUP_LINES}"),
        ] {
            shell.ch.sendline(cmd, true)?;
            shell.ch.read_until_prompt(None, Some(HANDSHAKE_LONG))?;
        }
        shell.ch.resize(SETUP_COLUMNS, SETUP_LINES)?;

        shell.sanity_check()?;
        debug!("shell on {} ready", shell.name);
        Ok(shell)
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.ch
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `cmd` to completion, returning its exit code and output.
    pub fn exec(&self, cmd: &str) -> Result<(i32, String)> {
        debug!("[{}] running {cmd:?}", self.name);
        self.ch.sendline(cmd, true)?;
        let out = self.ch.read_until_prompt(None, None)?;
        let code = self.fetch_retcode()?;
        debug!("[{}] {cmd:?} exited with {code}", self.name);
        Ok((code, out))
    }

    /// Run `cmd`, failing with [`ShellError::CommandFailure`] on a non-zero
    /// exit code. Returns the command's output.
    pub fn exec0(&self, cmd: &str) -> Result<String> {
        let (code, out) = self.exec(cmd)?;
        if code != 0 {
            return Err(ShellError::CommandFailure {
                cmd: cmd.to_string(),
                out,
            }
            .into());
        }
        Ok(out)
    }

    /// Run `cmd` and report whether it succeeded.
    pub fn test(&self, cmd: &str) -> Result<bool> {
        Ok(self.exec(cmd)?.0 == 0)
    }

    /// Start `cmd` and hand back a proxy for interacting with it while it
    /// runs. The caller must terminate the proxy.
    pub fn run(&self, cmd: &str) -> Result<CommandProxy<'_>> {
        debug!("[{}] starting {cmd:?}", self.name);
        self.ch.sendline(cmd, true)?;
        Ok(CommandProxy::new(self, cmd))
    }

    /// Drop the user into an interactive shell on this machine.
    ///
    /// Spawns a disposable inner shell so the user can do anything, including
    /// exiting, without disturbing the managed session. Returns once the
    /// inner shell ends and the managed prompt is reacquired.
    pub fn interactive(&self) -> Result<()> {
        let nonce = RandomState::new().build_hasher().finish();
        let end_magic = format!("TESTRIG-INTERACTIVE-END-{nonce:016x}");

        let (columns, lines) = crate::channel::local_termsize();
        self.ch.resize(columns, lines)?;
        self.ch
            .sendline(format!("stty cols {columns} rows {lines}"), true)?;
        self.ch.read_until_prompt(None, Some(HANDSHAKE_LONG))?;

        self.ch.sendline(
            format!("PS1='{}> ' sh -i; echo {end_magic}", self.name),
            true,
        )?;
        // The inner prompt, possibly wrapped in terminal control sequences.
        self.ch.expect(
            &[BoundedPattern::regex(r"> (\x1b\[.{0,16})?")?],
            Some(HANDSHAKE_LONG),
        )?;
        info!("entering interactive shell on {}, exit it to return", self.name);

        self.ch
            .attach_interactive(Some(&BoundedPattern::literal(&end_magic)), false)?;

        // The inner shell is gone; reacquire our own prompt.
        let prompt = [BoundedPattern::literal(SHELL_PROMPT)];
        let mut reacquired = false;
        for _ in 0..5 {
            self.ch.sendline("", false)?;
            match self.ch.expect(&prompt, Some(Duration::from_millis(500))) {
                Ok(_) => {
                    reacquired = true;
                    break;
                }
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            }
        }
        if !reacquired {
            return Err(ShellError::PromptLost.into());
        }

        self.ch.resize(SETUP_COLUMNS, SETUP_LINES)?;
        self.ch
            .sendline(format!("stty cols {SETUP_COLUMNS} rows {SETUP_LINES}"), true)?;
        self.ch.read_until_prompt(None, Some(HANDSHAKE_LONG))?;
        info!("interactive shell on {} closed", self.name);
        Ok(())
    }

    /// Run `cmd` as the new owner of this channel.
    ///
    /// For commands that speak their own protocol over the connection, e.g. a
    /// console multiplexer. The shell session ends; when `cmd` exits, the
    /// shell exits with it. Returns the channel, re-owned.
    pub fn open_channel(self, cmd: &str) -> Result<Channel> {
        debug!("[{}] handing channel over to {cmd:?}", self.name);
        // Keep Ctrl-C deliverable to the new foreground command only.
        self.ch.sendline("stty -isig", true)?;
        self.ch.read_until_prompt(None, Some(HANDSHAKE_LONG))?;
        self.ch.sendline(format!("{cmd}; exit"), true)?;
        let ch = self.ch.take()?;
        ch.set_prompt(None)?;
        Ok(ch)
    }

    /// End the shell and close the channel.
    pub fn close(self) -> Result<()> {
        if !self.ch.is_closed()? {
            if let Err(e) = self.ch.sendline("exit", false) {
                warn!("[{}] failed to send exit: {e}", self.name);
            }
            self.ch.close()?;
        }
        Ok(())
    }

    /// Probe `$?` for the exit code of the last command.
    pub(crate) fn fetch_retcode(&self) -> Result<i32> {
        self.ch.sendline("echo $?", true)?;
        let out = self.ch.read_until_prompt(None, None)?;
        let trimmed = out.trim();
        trimmed
            .parse::<i32>()
            .map_err(|_| ShellError::InvalidRetcode(trimmed.to_string()).into())
    }

    /// Verify the shell echoes a known token back unmangled.
    fn sanity_check(&self) -> Result<()> {
        self.ch.sendline(mangle_echo(SANITY_TOKEN), true)?;
        let out = self.ch.read_until_prompt(None, Some(HANDSHAKE_LONG))?;
        if out.trim() != SANITY_TOKEN {
            return Err(ShellError::SanityCheck {
                output: out.trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}


/// Protocol tests against a scripted transport that plays the remote shell.
#[cfg(test)]
mod protocol_tests {
    use super::*;
    use crate::channel::ChannelIO;
    use crate::error::{ChannelError, Error};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Instant;

    const PROMPT: &str = "TESTRIG-VC9QK$ ";

    #[derive(Debug)]
    enum Step {
        /// Wait for these exact bytes to be written.
        Recv(Vec<u8>),
        /// Emit these bytes for reading.
        Send(Vec<u8>),
    }

    struct ScriptState {
        steps: VecDeque<Step>,
        inbox: Vec<u8>,
        pending: Vec<u8>,
        closed: bool,
    }

    /// Transport that follows a write/response script. A read that the script
    /// cannot answer sleeps out its timeout like a silent remote would.
    struct ScriptIo(Rc<RefCell<ScriptState>>);

    fn script(steps: Vec<Step>) -> (ScriptIo, Rc<RefCell<ScriptState>>) {
        let state = Rc::new(RefCell::new(ScriptState {
            steps: steps.into(),
            inbox: Vec::new(),
            pending: Vec::new(),
            closed: false,
        }));
        (ScriptIo(state.clone()), state)
    }

    impl ScriptState {
        /// Consume satisfied Recv steps and promote Send steps.
        fn advance(&mut self) {
            loop {
                match self.steps.front() {
                    Some(Step::Send(_)) => {
                        let Some(Step::Send(data)) = self.steps.pop_front() else {
                            unreachable!()
                        };
                        self.pending.extend_from_slice(&data);
                    }
                    Some(Step::Recv(expected)) => {
                        if self.inbox.starts_with(expected) {
                            let n = expected.len();
                            self.inbox.drain(..n);
                            self.steps.pop_front();
                        } else if !self.inbox.is_empty()
                            && !expected.starts_with(&self.inbox)
                        {
                            panic!(
                                "script mismatch: expected write {:?}, got {:?}",
                                String::from_utf8_lossy(expected),
                                String::from_utf8_lossy(&self.inbox)
                            );
                        } else {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }

    impl ChannelIO for ScriptIo {
        fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, ChannelError> {
            let mut st = self.0.borrow_mut();
            if st.closed {
                return Err(ChannelError::Closed);
            }
            st.inbox.extend_from_slice(buf);
            st.advance();
            Ok(buf.len())
        }

        fn read(
            &mut self,
            max: usize,
            timeout: Option<Duration>,
        ) -> std::result::Result<Vec<u8>, ChannelError> {
            let mut st = self.0.borrow_mut();
            if st.closed {
                return Err(ChannelError::Closed);
            }
            st.advance();
            if !st.pending.is_empty() {
                let n = max.min(st.pending.len());
                return Ok(st.pending.drain(..n).collect());
            }
            match timeout {
                Some(t) => {
                    drop(st);
                    std::thread::sleep(t);
                    Err(ChannelError::Timeout(t))
                }
                None => panic!(
                    "script stalled without a timeout, next step: {:?}",
                    st.steps.front()
                ),
            }
        }

        fn close(&mut self) -> std::result::Result<(), ChannelError> {
            let mut st = self.0.borrow_mut();
            if st.closed {
                return Err(ChannelError::Closed);
            }
            st.closed = true;
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.0.borrow().closed
        }
    }

    fn recv_line(cmd: &str) -> Step {
        Step::Recv(format!("{cmd}\n").into_bytes())
    }

    /// Echo of `cmd` plus `output` plus a fresh prompt.
    fn send_reply(cmd: &str, output: &str) -> Step {
        Step::Send(format!("{cmd}\r\n{output}{PROMPT}").into_bytes())
    }

    /// The full write/response exchange of a successful setup.
    fn setup_steps() -> Vec<Step> {
        let ps1 = format!("PS1='{}''{}'", &PROMPT[..6], &PROMPT[6..]);
        let sanity = "echo TESTRIG-SA''NITY-CHECK";
        let mut steps = vec![
            recv_line("echo RBOT\\LOGIN"),
            Step::Send(b"echo RBOT\\LOGIN\r\nRBOTLOGIN\r\n".to_vec()),
            recv_line(&ps1),
            Step::Send(format!("{ps1}\r\n{PROMPT}").into_bytes()),
        ];
        for cmd in [
            "unset HISTFILE",
            "set +o emacs; set +o vi",
            "PS2=''; histchars=''",
            "stty cols 80 rows 24",
        ] {
            steps.push(recv_line(cmd));
            steps.push(send_reply(cmd, ""));
        }
        steps.push(recv_line(sanity));
        steps.push(send_reply(sanity, "TESTRIG-SANITY-CHECK\r\n"));
        steps
    }

    /// The exchange for one `exec` call.
    fn exec_steps(cmd: &str, output: &str, retcode: &str) -> Vec<Step> {
        vec![
            recv_line(cmd),
            send_reply(cmd, output),
            recv_line("echo $?"),
            send_reply("echo $?", &format!("{retcode}\r\n")),
        ]
    }

    fn shell_with(extra: Vec<Step>) -> (ShellSession, Rc<RefCell<ScriptState>>) {
        let mut steps = setup_steps();
        steps.extend(extra);
        let (io, state) = script(steps);
        let shell = ShellSession::setup(Channel::new(Box::new(io)), "scripted").unwrap();
        (shell, state)
    }

    #[test]
    fn test_setup_completes_and_consumes_script() {
        let (_shell, state) = shell_with(vec![]);
        assert!(state.borrow().steps.is_empty());
    }

    #[test]
    fn test_handshake_retries_after_silence() {
        // The first probe goes unanswered; the shell only responds to the
        // second one.
        let probe = recv_line("echo RBOT\\LOGIN");
        let (io, _state) = script(vec![
            probe,
            recv_line("echo RBOT\\LOGIN"),
            Step::Send(b"RBOTLOGIN\r\n".to_vec()),
        ]);
        let ch = Channel::new(Box::new(io));
        let start = Instant::now();
        wait_for_shell(&ch).unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= HANDSHAKE_SHORT, "retried too early: {elapsed:?}");
        assert!(elapsed < HANDSHAKE_SHORT + HANDSHAKE_LONG);
    }

    #[test]
    fn test_handshake_probes_beyond_two_attempts() {
        // A slowly booting board stays silent through the short deadline and
        // a full long one; the handshake must still be probing afterwards.
        let (io, state) = script(vec![
            recv_line("echo RBOT\\LOGIN"),
            recv_line("echo RBOT\\LOGIN"),
            recv_line("echo RBOT\\LOGIN"),
            Step::Send(b"RBOTLOGIN\r\n".to_vec()),
        ]);
        let ch = Channel::new(Box::new(io));
        let start = Instant::now();
        wait_for_shell(&ch).unwrap();
        let elapsed = start.elapsed();
        assert!(
            elapsed >= HANDSHAKE_SHORT + HANDSHAKE_LONG,
            "answered before the third probe: {elapsed:?}"
        );
        assert!(state.borrow().steps.is_empty());
    }

    #[test]
    fn test_handshake_fails_on_closed_channel() {
        // A dead transport ends the probing; timeouts alone never do.
        let (io, state) = script(vec![]);
        state.borrow_mut().closed = true;
        let ch = Channel::new(Box::new(io));
        let err = wait_for_shell(&ch).unwrap_err();
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_sanity_check_failure() {
        let mut steps = setup_steps();
        // Replace the sanity reply with a shell that mangles output.
        steps.pop();
        steps.push(send_reply(
            "echo TESTRIG-SA''NITY-CHECK",
            "TESTRIG-SANITY-CHECKK\r\n",
        ));
        let (io, _state) = script(steps);
        let Err(err) = ShellSession::setup(Channel::new(Box::new(io)), "bad") else {
            panic!("setup accepted a shell that mangles output");
        };
        assert!(matches!(
            err,
            Error::Shell(ShellError::SanityCheck { .. })
        ));
    }

    #[test]
    fn test_exec_captures_output_and_retcode() {
        let (shell, state) = shell_with(exec_steps("uname -s", "Linux\r\n", "0"));
        let (code, out) = shell.exec("uname -s").unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, "Linux\n");
        assert!(state.borrow().steps.is_empty());
    }

    #[test]
    fn test_exec_nonzero_retcode() {
        let (shell, _state) = shell_with(exec_steps("false", "", "1"));
        assert_eq!(shell.exec("false").unwrap().0, 1);
    }

    #[test]
    fn test_exec0_fails_on_nonzero() {
        let (shell, _state) = shell_with(exec_steps("false", "", "1"));
        assert!(matches!(
            shell.exec0("false"),
            Err(Error::Shell(ShellError::CommandFailure { .. }))
        ));
    }

    #[test]
    fn test_test_maps_retcode_to_bool() {
        let mut extra = exec_steps("true", "", "0");
        extra.extend(exec_steps("false", "", "1"));
        let (shell, _state) = shell_with(extra);
        assert!(shell.test("true").unwrap());
        assert!(!shell.test("false").unwrap());
    }

    #[test]
    fn test_exec_full_retcode_range() {
        let mut extra = exec_steps("sh -c 'exit 255'", "", "255");
        extra.extend(exec_steps("sh -c 'exit 130'", "", "130"));
        let (shell, _state) = shell_with(extra);
        assert_eq!(shell.exec("sh -c 'exit 255'").unwrap().0, 255);
        assert_eq!(shell.exec("sh -c 'exit 130'").unwrap().0, 130);
    }

    #[test]
    fn test_invalid_retcode() {
        let mut steps = vec![recv_line("true"), send_reply("true", "")];
        steps.push(recv_line("echo $?"));
        // A shell that lost its mind answers the probe with garbage.
        steps.push(send_reply("echo $?", "whoops\r\n"));
        let (shell, _state) = shell_with(steps);
        assert!(matches!(
            shell.exec("true"),
            Err(Error::Shell(ShellError::InvalidRetcode(s))) if s == "whoops"
        ));
    }

    #[test]
    fn test_run_proxy_interact_and_terminate() {
        let cmd = "cat";
        let mut extra = vec![
            recv_line(cmd),
            Step::Send(format!("{cmd}\r\n").into_bytes()),
            Step::Recv(b"hello\n".to_vec()),
            Step::Send(b"hello\r\n".to_vec()),
            // ^D ends cat, the prompt returns.
            Step::Recv(vec![0x04]),
            Step::Send(PROMPT.as_bytes().to_vec()),
        ];
        extra.push(recv_line("echo $?"));
        extra.push(send_reply("echo $?", "0\r\n"));
        let (shell, state) = shell_with(extra);

        let proxy = shell.run(cmd).unwrap();
        proxy.sendline("hello").unwrap();
        assert_eq!(proxy.readline(None).unwrap(), "hello\n");
        proxy.sendcontrol('d').unwrap();
        let (code, out) = proxy.terminate().unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, "");
        assert!(state.borrow().steps.is_empty());
    }

    #[test]
    fn test_open_channel_hands_over_ownership() {
        let cmd = "microcom /dev/ttyUSB1";
        let handover = format!("{cmd}; exit");
        let extra = vec![
            recv_line("stty -isig"),
            send_reply("stty -isig", ""),
            recv_line(&handover),
            Step::Send(format!("{handover}\r\nconsole data").into_bytes()),
        ];
        let (shell, _state) = shell_with(extra);
        let ch = shell.open_channel(cmd).unwrap();
        let m = ch
            .expect(&[BoundedPattern::literal("console data")], None)
            .unwrap();
        assert_eq!(m.matched, b"console data");
    }
}
