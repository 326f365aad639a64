//! Board and host test automation over serial, SSH and local consoles.
//!
//! testrig gives test code deterministic control over machines that only
//! expose a textual console. It is built from three layers:
//!
//! - [`channel`]: buffered channels over raw transports with expect-style
//!   pattern matching, death-string monitoring and exclusive-access handoff.
//! - [`shell`]: a deterministic shell protocol on top of a channel, with
//!   synchronous command execution, exit-code capture and interactive attach.
//! - [`context`]: role-addressed machine lifecycle management with lazy
//!   initialization, shared/exclusive requests and ordered teardown.
//!
//! ```no_run
//! use testrig::{Config, Context, ContextConfig, RequestOpts};
//! use testrig::machine::ShellMachine;
//!
//! # fn main() -> testrig::Result<()> {
//! let config: Config = serde_json::from_str(
//!     r#"{"targets": {"board": {
//!         "roles": ["target"],
//!         "connector": {"type": "serial", "device": "/dev/ttyUSB0", "baud": 115200}
//!     }}}"#,
//! )
//! .expect("invalid target config");
//! let ctx = Context::new(ContextConfig::default());
//! config.register_machines(&ctx)?;
//!
//! let board = ctx.request("target", &RequestOpts::default())?;
//! let kernel = board.with(|m: &mut ShellMachine| -> testrig::Result<String> {
//!     m.shell()?.exec0("uname -r")
//! })??;
//! println!("running {kernel}");
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod machine;
pub mod shell;

pub use channel::{BoundedPattern, Channel, ChannelIO, ExpectMatch};
pub use config::Config;
pub use context::{Context, ContextConfig, MachineGuard, RequestOpts};
pub use error::{ChannelError, ContextError, Error, Result, ShellError};
pub use shell::ShellSession;
