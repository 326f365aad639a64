//! Error types for testrig.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for testrig operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Channel operation errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Shell protocol errors
    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    /// Context/lifecycle errors
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
}

/// Channel layer errors (transport I/O, access control, expect matching).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The transport ended or was closed.
    #[error("Channel closed")]
    Closed,

    /// The channel is currently delegated to a borrower.
    #[error("Channel is currently borrowed by another machine")]
    Borrowed,

    /// The channel was permanently handed over via `take()`.
    #[error("Channel was taken by another machine and can no longer be accessed from here")]
    Taken,

    /// No data or pattern match within the deadline. The receive buffer is
    /// left intact so the caller may retry.
    #[error("No data or pattern match within {0:?}")]
    Timeout(Duration),

    /// A registered death pattern was observed while reading.
    #[error("Death string observed on channel: {}", String::from_utf8_lossy(.0))]
    DeathString(Vec<u8>),

    /// Refusing to write a blacklisted byte without an explicit override.
    #[error("Refusing to write blacklisted byte {0:#04x} to channel")]
    IllegalData(u8),

    /// A regex pattern without a provable maximum match length.
    #[error("Pattern {0:?} is not bounded")]
    UnboundedPattern(String),

    /// Pattern failed to compile.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The transport does not support the requested operation.
    #[error("Operation not supported by this transport: {0}")]
    Unsupported(&'static str),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Shell protocol errors (command execution, retcode parsing).
#[derive(Error, Debug)]
pub enum ShellError {
    /// The retcode probe returned something that is not an integer.
    #[error("Received {0:?} instead of a return code integer")]
    InvalidRetcode(String),

    /// A command exited with a non-zero exit code.
    #[error("Command failed: {cmd}")]
    CommandFailure { cmd: String, out: String },

    /// The post-handshake sanity check produced unexpected output.
    #[error("Shell sanity check failed, got {output:?}")]
    SanityCheck { output: String },

    /// The shell prompt could not be reacquired after an interactive session.
    #[error("Failed to reacquire shell prompt after interactive session")]
    PromptLost,
}

/// Context layer errors (role registry, instance lifecycle).
#[derive(Error, Debug)]
pub enum ContextError {
    /// A non-weak machine registration already exists for this role.
    #[error("A machine is already registered for role {0:?}")]
    RoleAlreadyBound(String),

    /// No machine registered for this role.
    #[error("No machine registered for role {0:?}")]
    UnknownRole(String),

    /// `init()` on an instance manager that already holds a live instance.
    #[error("Trying to re-initialize a live instance of {0:?}")]
    AlreadyInitialized(String),

    /// Access or teardown of an instance that is not alive.
    #[error("Trying to access a closed instance of {0:?}")]
    NotAlive(String),

    /// The instance is exclusively held by another request.
    #[error("Instance of {0:?} is exclusively held and not available")]
    NotAvailable(String),

    /// A second teardown was attempted while one is already in flight.
    #[error("Teardown of {0:?} is already in progress")]
    TeardownReentrancy(String),

    /// The guard's machine is not of the requested concrete type.
    #[error("Instance of {0:?} is not of the requested machine type")]
    MachineTypeMismatch(String),

    /// A keep-alive context was used without entering its activation scope.
    #[error("A keep-alive context must be entered before requesting instances")]
    InactiveContext,
}

/// Result type alias using testrig's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is an expect/read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::Timeout(_)))
    }
}
