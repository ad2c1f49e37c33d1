//! Error types for the upgrade engine.

use std::time::Duration;

use thiserror::Error;

use charmroll_client::ClientError;
use charmroll_converge::ConvergeError;
use charmroll_core::ActionStatus;

/// Result type alias for upgrade operations.
pub type UpgradeResult<T> = Result<T, UpgradeError>;

/// Errors that abort an upgrade run.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Converge(#[from] ConvergeError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("errors during upgrade of charm revisions: {0}")]
    RevisionPhase(String),

    #[error("action {action} on {unit} did not finish within {timeout:?}")]
    ActionTimeout {
        unit: String,
        action: String,
        timeout: Duration,
    },

    #[error("action {action} on {unit} finished as {status}")]
    ActionFailed {
        unit: String,
        action: String,
        status: ActionStatus,
    },

    #[error("no unit of {application} reports leadership")]
    NoLeader { application: String },

    #[error("several units of {application} report leadership: {}", units.join(", "))]
    MultipleLeaders {
        application: String,
        units: Vec<String>,
    },

    #[error("subordinate units {first} and {second} of {application} share address {address}")]
    PairingConflict {
        application: String,
        address: String,
        first: String,
        second: String,
    },

    #[error("{application} still reports an upgrade in progress after {timeout:?}")]
    BulkTimeout {
        application: String,
        timeout: Duration,
    },
}

impl UpgradeError {
    /// The controller connection was lost.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            UpgradeError::Converge(ConvergeError::ConnectionClosed) => true,
            UpgradeError::Converge(ConvergeError::Client(e)) | UpgradeError::Client(e) => {
                e.is_connection()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_loss_is_recognised_through_layers() {
        assert!(UpgradeError::Converge(ConvergeError::ConnectionClosed).is_connection_lost());
        assert!(UpgradeError::Client(ClientError::Connection("reset".into())).is_connection_lost());
        assert!(!UpgradeError::Converge(ConvergeError::Timeout(Duration::from_secs(1))).is_connection_lost());
        assert!(!UpgradeError::RevisionPhase("glance".into()).is_connection_lost());
    }
}
