//! Error types for cluster client operations.

use thiserror::Error;

/// Result type alias for cluster client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Remote rejections that mean "this is already done". Matched against
/// the controller's error text because no structured code exists.
const BENIGN_CONFLICTS: &[&str] = &["already exists", "No such file"];

/// Errors that can occur while talking to the cluster.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection to the controller lost: {0}")]
    Connection(String),

    #[error("rejected by the controller: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("catalog lookup failed: {0}")]
    Catalog(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("unexpected output: {0}")]
    Parse(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// The link to the controller is gone.
    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }

    /// Idempotent conflict the caller may ignore.
    pub fn is_benign_conflict(&self) -> bool {
        match self {
            ClientError::Rejected(msg) | ClientError::Command(msg) => {
                BENIGN_CONFLICTS.iter().any(|needle| msg.contains(needle))
            }
            _ => false,
        }
    }

    /// The controller refused the request (as opposed to a local or
    /// transport failure).
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::Rejected(_) | ClientError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_is_benign() {
        let err = ClientError::Rejected(
            "cannot add relation \"nova-compute:ceph-access cinder-ceph:ceph-access\": relation already exists".into(),
        );
        assert!(err.is_benign_conflict());
        assert!(err.is_rejection());
        assert!(!err.is_connection());
    }

    #[test]
    fn other_rejections_are_not_benign() {
        let err = ClientError::Rejected("application \"nova\" not found".into());
        assert!(!err.is_benign_conflict());
        assert!(!ClientError::Connection("already exists".into()).is_benign_conflict());
    }
}
