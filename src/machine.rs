//! Machines: named resources with a lifecycle.
//!
//! A [`Machine`] is anything the context can hand out to test code, usually a
//! board or host reachable through a channel. [`Connector`]s describe how to
//! reach one; [`ShellMachine`] is the common case of a machine that exposes a
//! managed shell.

use std::any::Any;
use std::path::PathBuf;

use log::info;
use secrecy::SecretString;

use crate::channel::{
    Channel, NullChannelIO, PtyChannelIO, SerialChannelIO, SshAuth, SshChannelIO,
    POSIX_WRITE_BLACKLIST,
};
use crate::error::{ChannelError, Result};
use crate::shell::ShellSession;

/// A named resource managed by a context.
///
/// The `Any` supertrait lets holders downcast a guard back to the concrete
/// machine type they registered.
pub trait Machine: Any {
    /// Stable display name, used in logs and errors.
    fn name(&self) -> &str;

    /// Release the machine's resources. Called exactly once by the owning
    /// context during teardown.
    fn close(&mut self) -> Result<()>;
}

/// A way of establishing a channel to a machine.
pub trait Connector {
    fn connect(&self) -> Result<Channel>;
}

/// Connects by spawning a local subprocess on a pty.
pub struct PtyConnector {
    pub program: String,
    pub args: Vec<String>,
}

impl PtyConnector {
    /// A connector for a plain local bash.
    pub fn local_bash() -> Self {
        Self {
            program: "bash".to_string(),
            args: ["--norc", "--noprofile", "--noediting", "-i"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl Connector for PtyConnector {
    fn connect(&self) -> Result<Channel> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let io = PtyChannelIO::spawn(&self.program, &args, 80, 24)?;
        Ok(Channel::new(Box::new(io)))
    }
}

/// Connects to a serial console device.
pub struct SerialConnector {
    pub device: String,
    pub baud: u32,
}

impl Connector for SerialConnector {
    fn connect(&self) -> Result<Channel> {
        let io = SerialChannelIO::open(&self.device, self.baud)?;
        Ok(Channel::new(Box::new(io)))
    }
}

/// Connects over SSH.
pub struct SshConnector {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<SecretString>,
    pub key_file: Option<PathBuf>,
}

impl Connector for SshConnector {
    fn connect(&self) -> Result<Channel> {
        let auth = if let Some(password) = &self.password {
            SshAuth::Password(password)
        } else if let Some(key) = &self.key_file {
            SshAuth::KeyFile(key)
        } else {
            SshAuth::Agent
        };
        let io = SshChannelIO::connect(&self.host, self.port, &self.user, auth, 80, 24)?;
        Ok(Channel::new(Box::new(io)))
    }
}

/// Produces channels that carry nothing. For machines that are configured but
/// not wired up, and for lifecycle tests.
#[derive(Debug, Default)]
pub struct NullConnector;

impl Connector for NullConnector {
    fn connect(&self) -> Result<Channel> {
        Ok(Channel::new(Box::new(NullChannelIO::new())))
    }
}

/// A machine that exposes a managed shell over its channel.
pub struct ShellMachine {
    name: String,
    shell: Option<ShellSession>,
}

impl ShellMachine {
    /// Connect and bring up a deterministic shell.
    pub fn connect(name: impl Into<String>, connector: &dyn Connector) -> Result<Self> {
        let name = name.into();
        let ch = connector.connect()?;
        ch.set_write_blacklist(POSIX_WRITE_BLACKLIST)?;
        let shell = ShellSession::setup(ch, name.clone())?;
        Ok(Self {
            name,
            shell: Some(shell),
        })
    }

    /// The managed shell session.
    pub fn shell(&self) -> Result<&ShellSession> {
        self.shell
            .as_ref()
            .ok_or_else(|| ChannelError::Closed.into())
    }
}

impl Machine for ShellMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if let Some(shell) = self.shell.take() {
            info!("closing shell machine {}", self.name);
            shell.close()?;
        }
        Ok(())
    }
}
