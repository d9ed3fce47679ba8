//! Ingestion client error types.

use sporekeeper_domain::error::{ProtocolFault, SporeKeeperError};

/// Errors specific to the remote HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The request could not be built or sent, or timed out.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// The remote answered with a non-success status.
    #[error("remote answered {status}")]
    Status { status: u16 },

    /// The remote answered with a body that does not follow the contract.
    #[error("invalid remote response")]
    Response(#[source] ProtocolFault),
}

impl From<IngestError> for SporeKeeperError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Response(fault) => Self::Protocol(fault),
            other => Self::network(other),
        }
    }
}
