//! MQTT adapter error types.

use sporekeeper_domain::error::{ProtocolFault, SporeKeeperError};

/// Errors specific to the MQTT adapter.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// No session is open.
    #[error("MQTT client not connected")]
    NotConnected,

    /// The broker did not acknowledge the connection in time.
    #[error("MQTT broker did not acknowledge the connection in time")]
    ConnectTimeout,

    /// The broker closed the session.
    #[error("MQTT broker closed the connection")]
    Disconnected,

    /// The rumqttc client rejected a request.
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),

    /// The rumqttc event loop lost its connection.
    #[error("MQTT connection error")]
    Connection(#[source] rumqttc::ConnectionError),

    /// A payload could not be decoded or encoded.
    #[error("invalid MQTT payload")]
    Payload(#[source] ProtocolFault),
}

impl From<MqttError> for SporeKeeperError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::Payload(fault) => Self::Protocol(fault),
            other => Self::network(other),
        }
    }
}
