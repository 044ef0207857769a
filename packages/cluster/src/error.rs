// ABOUTME: Error types for the cluster client and the adapter built on top of it
// ABOUTME: Classifies every adapter failure as NotFound, Conflict, Transient or Fatal

use kubedock_storage::StorageError;
use thiserror::Error;

/// Failures reported by a [`crate::client::ClusterClient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    #[error("Cluster API error: {0}")]
    Api(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The entity or cluster resource does not exist.
    NotFound,
    /// The operation is not valid in the container's current lifecycle phase.
    Conflict,
    /// A bounded wait expired or the cluster could not be reached; retry later.
    Transient,
    /// Corruption, permission problems or broken invariants.
    Fatal,
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Pod failed to start: {0}")]
    StartFailed(String),

    #[error("Archive extraction failed: {0}")]
    ArchiveFailed(String),

    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Timeout { .. } | Self::Cancelled(_) | Self::Io(_) => ErrorKind::Transient,
            Self::StartFailed(_) | Self::ArchiveFailed(_) => ErrorKind::Fatal,
            Self::Cluster(e) => match e {
                ClusterError::NotFound(_) => ErrorKind::NotFound,
                ClusterError::AlreadyExists(_) => ErrorKind::Conflict,
                ClusterError::Unavailable(_) | ClusterError::Stream(_) => ErrorKind::Transient,
                ClusterError::Forbidden(_) | ClusterError::Api(_) => ErrorKind::Fatal,
            },
            Self::Storage(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(AdapterError::NotFound("x".into()), ErrorKind::NotFound)]
    #[case(AdapterError::Conflict("not running".into()), ErrorKind::Conflict)]
    #[case(AdapterError::Timeout { what: "pod".into(), seconds: 5 }, ErrorKind::Transient)]
    #[case(AdapterError::Cancelled("logs".into()), ErrorKind::Transient)]
    #[case(AdapterError::ArchiveFailed("exit 2".into()), ErrorKind::Fatal)]
    #[case(ClusterError::NotFound("pod".into()).into(), ErrorKind::NotFound)]
    #[case(ClusterError::AlreadyExists("pod".into()).into(), ErrorKind::Conflict)]
    #[case(ClusterError::Unavailable("refused".into()).into(), ErrorKind::Transient)]
    #[case(ClusterError::Forbidden("rbac".into()).into(), ErrorKind::Fatal)]
    #[case(StorageError::Corrupt("bad".into()).into(), ErrorKind::Fatal)]
    #[case(StorageError::NotFound { entity: "container", id: "a".into() }.into(), ErrorKind::NotFound)]
    fn test_error_kinds(#[case] error: AdapterError, #[case] expected: ErrorKind) {
        assert_eq!(error.kind(), expected);
    }
}
