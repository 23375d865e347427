//! Sandbox error types.

use thiserror::Error;

use crate::state::Phase;

/// Errors raised while preparing or driving an execution.
///
/// None of these are shown to visitors; the executor logs them and
/// synthesizes a generic response.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no execution slot became free in time")]
    Busy,

    #[error("failed to load entry script {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("entry script does not export `{0}`")]
    MissingExport(&'static str),

    #[error("illegal execution transition {from:?} -> {to:?}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("engine error: {0}")]
    Engine(#[from] anyhow::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;
