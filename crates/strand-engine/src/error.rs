//! Failure channel shared by futures, fibers and the kernel.
//!
//! Every failure that crosses a suspension point travels as an [`Error`].
//! The escape signal is a variant of the same enum so it can ride `?`
//! through user code, but the bridge dispatches it explicitly and never
//! stores it in a future.

use crate::fiber::FiberId;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors observable by coroutine bodies, handlers and the kernel caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Structured unwind-and-stop request (not a failure)
    #[error("escape requested")]
    Escape,

    /// Failure raised by user code
    #[error("{0}")]
    Application(String),

    /// Coroutine terminated but its return value cannot be retrieved
    #[error("coroutine ended in an invalid state: {0}")]
    InvalidEndState(String),

    /// Coroutine body panicked
    #[error("coroutine panicked: {0}")]
    Panicked(String),

    /// Misuse of the fiber primitive
    #[error("fiber error: {0}")]
    FiberState(&'static str),

    /// Misuse of a suspension handle
    #[error("suspension error: {0}")]
    Suspension(&'static str),

    /// The event loop ran out of registrations before a root suspension resumed
    #[error("event loop exhausted without resuming the current suspension")]
    LoopExhausted,

    /// Registry already holds a record for this coroutine
    #[error("coroutine {0} is already registered")]
    DuplicateCoroutine(FiberId),

    /// The OS refused to create a coroutine stack
    #[error("failed to spawn coroutine stack: {0}")]
    Spawn(String),
}

impl Error {
    /// Build an application failure from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Application(message.into())
    }

    /// Whether this is the escape signal.
    pub fn is_escape(&self) -> bool {
        matches!(self, Error::Escape)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Application(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Application(message.to_string())
    }
}

/// Diagnostics sink for failures that have no caller left to receive them.
pub fn report_failure(error: &Error) {
    tracing::error!(error = %error, "unhandled coroutine failure");
}
