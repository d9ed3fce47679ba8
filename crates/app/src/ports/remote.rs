//! Remote ports: the ingestion endpoint and the command/heartbeat transport.

use std::future::Future;

use serde::{Deserialize, Serialize};
use sporekeeper_domain::command::ChannelMessage;
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::sync::EntityType;

/// One entity in an ingestion batch, keyed by its client-generated id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestItem {
    pub id: String,
    pub payload: serde_json::Value,
}

/// Per-item verdict of the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub id: String,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Remote canonical store. Upserts by item id.
pub trait IngestionClient: Send + Sync {
    /// Send one batch of a single entity type.
    ///
    /// An `Err` means the batch may not have been judged at all; the caller
    /// retries it without counting an attempt against any item.
    fn send_batch(
        &self,
        entity_type: EntityType,
        items: Vec<IngestItem>,
    ) -> impl Future<Output = Result<Vec<ItemOutcome>, SporeKeeperError>> + Send;
}

/// Bidirectional low-latency message transport for the command channel.
pub trait CommandTransport: Send {
    fn connect(&mut self) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Wait for the next inbound message.
    ///
    /// [`SporeKeeperError::Protocol`] reports a single malformed message and
    /// leaves the transport usable; any other error means the connection is
    /// gone.
    fn recv(&mut self) -> impl Future<Output = Result<ChannelMessage, SporeKeeperError>> + Send;

    fn send(
        &mut self,
        message: ChannelMessage,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;
}
