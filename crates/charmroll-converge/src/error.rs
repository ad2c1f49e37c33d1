//! Error types for convergence waits.

use std::time::Duration;

use thiserror::Error;

use charmroll_client::ClientError;

/// Result type alias for convergence waits.
pub type ConvergeResult<T> = Result<T, ConvergeError>;

/// Ways a convergence wait can end without converging.
#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("connection to the controller closed while waiting")]
    ConnectionClosed,

    #[error("fleet did not converge within {0:?}")]
    Timeout(Duration),

    #[error("applications stayed in error for {elapsed:?}: {}", applications.join(", "))]
    ApplicationErrorTimeout {
        applications: Vec<String>,
        elapsed: Duration,
    },

    #[error(transparent)]
    Client(#[from] ClientError),
}
