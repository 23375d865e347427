//! Deployment error types.

use thiserror::Error;

use nimbus_core::{ContainmentError, LabelError};
use nimbus_state::StateError;

/// Why a deploy was rejected or failed.
///
/// Every variant maps to an HTTP status through [`DeployError::status`].
/// Rejections (4xx) leave no trace on disk; failures (5xx) leave the
/// previous release live.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid site label: {0}")]
    InvalidLabel(#[from] LabelError),

    #[error("archive is {size} bytes, limit is {limit}")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("bundle expands past {limit} bytes")]
    ExtractedTooLarge { limit: u64 },

    #[error("bundle has more than {limit} files")]
    TooManyFiles { limit: u64 },

    #[error("unsafe path in bundle: {0}")]
    UnsafePath(#[from] ContainmentError),

    #[error("links are not allowed in bundles: {0}")]
    LinkEntry(String),

    #[error("unsupported entry type in bundle: {0}")]
    UnsupportedEntry(String),

    #[error("bundle contains no files")]
    EmptyBundle,

    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn status(&self) -> u16 {
        match self {
            DeployError::InvalidLabel(_)
            | DeployError::UnsafePath(_)
            | DeployError::LinkEntry(_)
            | DeployError::UnsupportedEntry(_)
            | DeployError::EmptyBundle
            | DeployError::MalformedArchive(_) => 400,
            DeployError::ArchiveTooLarge { .. }
            | DeployError::ExtractedTooLarge { .. }
            | DeployError::TooManyFiles { .. } => 413,
            DeployError::Io(_) | DeployError::State(_) | DeployError::Internal(_) => 500,
        }
    }

    /// Message safe to return to the caller. Server-side failures are not
    /// described.
    pub fn public_message(&self) -> String {
        match self.status() {
            500 => "deployment failed".to_string(),
            _ => self.to_string(),
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

/// Registry lookups fail only on storage I/O.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(DeployError::EmptyBundle.status(), 400);
        assert_eq!(
            DeployError::UnsafePath(ContainmentError::Escapes("../x".into())).status(),
            400
        );
        assert_eq!(
            DeployError::ArchiveTooLarge { size: 10, limit: 1 }.status(),
            413
        );
        assert_eq!(DeployError::TooManyFiles { limit: 1 }.status(), 413);
        assert_eq!(DeployError::Internal("x".into()).status(), 500);
    }

    #[test]
    fn server_failures_are_not_described() {
        let err = DeployError::Io(std::io::Error::other("/var/lib/nimbus/secret-path"));
        assert_eq!(err.public_message(), "deployment failed");
        assert!(DeployError::EmptyBundle.public_message().contains("no files"));
    }
}
