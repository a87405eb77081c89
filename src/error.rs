//! Error taxonomy of the execution engine.

use crate::command::ExitCode;
use crate::parser::ParsingError;
use std::io;
use thiserror::Error;

/// Failure of one engine step.
///
/// Resolution, launch, redirection and script errors are caught at the
/// pipeline-stage boundary and turned into a failed status for that stage.
/// [`ExecError::Invariant`] is different: it means the engine itself was
/// driven incorrectly and is propagated to the caller of the current line.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}: command not found")]
    Resolution(String),

    #[error("{name}: {reason}")]
    Launch { name: String, reason: String },

    #[error("script error: {0}")]
    Script(String),

    #[error("redirection error: {0}")]
    Redirection(String),

    #[error("internal error: {0}")]
    Invariant(String),

    #[error(transparent)]
    Parse(#[from] ParsingError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ExecError {
    pub(crate) fn launch(name: impl Into<String>, reason: impl ToString) -> Self {
        ExecError::Launch {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Status reported to `&&`/`||` chains when a stage fails with this error.
    pub fn status(&self) -> ExitCode {
        match self {
            ExecError::Resolution(_) => 127,
            ExecError::Launch { .. } => 126,
            _ => 1,
        }
    }

    /// Whether this error is a contract breach rather than a user-level failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::Invariant(_))
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
