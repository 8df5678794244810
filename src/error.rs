//! Error taxonomy for the engine (spec §7).
//!
//! Every fallible call in this crate returns [`Result<T>`], a
//! `stacked_errors::Result` so that call sites can keep stacking context with
//! `.stack()`/`.stack_err(..)` without losing the original cause. Errors that
//! need to be distinguished by *kind* (a parse failure vs. a daemon failure vs.
//! a cancellation) carry an [`ErrorKind`] leaf via `Error::from_err`.

pub use stacked_errors::{Error, Result, StackableErr};

/// Distinguishes errors by the policy in spec §7. `Cache` is deliberately
/// absent: cache read/write failures are logged and swallowed, they never
/// reach a caller as an `ErrorKind`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    /// Parse failures, unknown directives, bad argument counts, and other
    /// mistakes in the Rockerfile or CLI invocation. Non-retryable, exit code
    /// 1.
    #[error("user input error: {0}")]
    UserInput(String),
    /// Passed through from the daemon client or object-store SDK, annotated
    /// with the operation that failed.
    #[error("collaborator error during {operation}: {source}")]
    Collaborator { operation: String, source: String },
    /// Filesystem/tar-pipeline IO errors.
    #[error("io error: {0}")]
    Io(String),
    /// The build was interrupted (ctrl-c / SIGTERM) mid-flight.
    #[error("build cancelled")]
    Cancelled,
}

impl ErrorKind {
    pub fn user_input(msg: impl Into<String>) -> Error {
        Error::from_err(ErrorKind::UserInput(msg.into()))
    }

    pub fn collaborator(operation: impl Into<String>, source: impl ToString) -> Error {
        Error::from_err(ErrorKind::Collaborator {
            operation: operation.into(),
            source: source.to_string(),
        })
    }

    pub fn io(msg: impl Into<String>) -> Error {
        Error::from_err(ErrorKind::Io(msg.into()))
    }

    pub fn cancelled() -> Error {
        Error::from_err(ErrorKind::Cancelled)
    }

    /// Best-effort downcast used by the binary entry point to pick an exit
    /// code (spec §6, Exit codes).
    pub fn is_user_input(err: &Error) -> bool {
        format!("{err:?}").contains("user input error")
    }

    pub fn is_cancelled(err: &Error) -> bool {
        format!("{err:?}").contains("build cancelled")
    }
}
