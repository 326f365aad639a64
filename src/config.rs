//! Declarative target configuration.
//!
//! A [`Config`] describes the machines a test run may use and how to reach
//! them. It is format-agnostic; anything serde can deserialize works.
//! [`Config::register_machines`] turns it into context registrations, with
//! connection deferred until a machine is first requested.

use std::path::PathBuf;
use std::rc::Rc;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;

use crate::context::Context;
use crate::error::Result;
use crate::machine::{
    Connector, NullConnector, PtyConnector, SerialConnector, ShellMachine, SshConnector,
};

fn default_ssh_port() -> u16 {
    22
}

/// How to establish the channel to a target.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorConfig {
    /// Spawn a local subprocess on a pty.
    Pty {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Open a serial console device.
    Serial { device: String, baud: u32 },
    /// Connect over SSH. Without a password or key file, the SSH agent is
    /// used.
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        user: String,
        #[serde(default)]
        password: Option<SecretString>,
        #[serde(default)]
        key_file: Option<PathBuf>,
    },
    /// A placeholder target that carries no data.
    Null,
}

impl ConnectorConfig {
    /// Build the connector this configuration describes.
    pub fn connector(&self) -> Box<dyn Connector> {
        match self {
            Self::Pty { program, args } => Box::new(PtyConnector {
                program: program.clone(),
                args: args.clone(),
            }),
            Self::Serial { device, baud } => Box::new(SerialConnector {
                device: device.clone(),
                baud: *baud,
            }),
            Self::Ssh {
                host,
                port,
                user,
                password,
                key_file,
            } => Box::new(SshConnector {
                host: host.clone(),
                port: *port,
                user: user.clone(),
                password: password.clone(),
                key_file: key_file.clone(),
            }),
            Self::Null => Box::new(NullConnector),
        }
    }
}

/// One configured machine.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Display name; defaults to the target's key in the config.
    #[serde(default)]
    pub name: Option<String>,
    /// Roles this target answers to.
    pub roles: Vec<String>,
    /// Register as a replaceable default.
    #[serde(default)]
    pub weak: bool,
    pub connector: ConnectorConfig,
}

/// The full target set for a test run, keyed by machine class.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub targets: IndexMap<String, TargetConfig>,
}

impl Config {
    /// Register every configured target with `ctx`.
    pub fn register_machines(&self, ctx: &Context) -> Result<()> {
        for (class, target) in &self.targets {
            let roles: Vec<&str> = target.roles.iter().map(String::as_str).collect();
            let name = target.name.clone().unwrap_or_else(|| class.clone());
            let connector = target.connector.clone();
            ctx.register_machine(
                class,
                &roles,
                target.weak,
                Rc::new(move |_ctx| {
                    let machine = ShellMachine::connect(name.clone(), &*connector.connector())?;
                    Ok(Box::new(machine))
                }),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_config() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "targets": {
                    "board-v2": {
                        "roles": ["target", "dut"],
                        "connector": {
                            "type": "serial",
                            "device": "/dev/ttyUSB0",
                            "baud": 115200
                        }
                    },
                    "buildhost": {
                        "name": "builder-01",
                        "roles": ["builder"],
                        "connector": {
                            "type": "ssh",
                            "host": "build.example.com",
                            "user": "ci",
                            "password": "hunter2"
                        }
                    },
                    "localhost": {
                        "roles": ["local"],
                        "weak": true,
                        "connector": {
                            "type": "pty",
                            "program": "bash",
                            "args": ["--norc", "-i"]
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.targets.len(), 3);
        let board = &cfg.targets["board-v2"];
        assert_eq!(board.roles, ["target", "dut"]);
        assert!(!board.weak);
        assert!(matches!(
            board.connector,
            ConnectorConfig::Serial { baud: 115200, .. }
        ));
        // Omitted SSH port falls back to 22.
        assert!(matches!(
            cfg.targets["buildhost"].connector,
            ConnectorConfig::Ssh { port: 22, .. }
        ));
        assert!(cfg.targets["localhost"].weak);
    }

    #[test]
    fn test_password_is_redacted_in_debug() {
        let cfg: ConnectorConfig = serde_json::from_str(
            r#"{"type": "ssh", "host": "h", "user": "u", "password": "hunter2"}"#,
        )
        .unwrap();
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }

    #[test]
    fn test_registration_is_lazy() {
        use crate::context::ContextConfig;

        let cfg: Config = serde_json::from_str(
            r#"{
                "targets": {
                    "ghost": {
                        "roles": ["target"],
                        "connector": {"type": "null"}
                    }
                }
            }"#,
        )
        .unwrap();
        // Registering never connects; the null target would fail on first
        // request, not here.
        let ctx = Context::new(ContextConfig::default());
        cfg.register_machines(&ctx).unwrap();
    }
}
