//! # sporekeeper-adapter-mqtt
//!
//! MQTT adapter: carries the command channel between the device and the
//! remote service.
//!
//! ## Responsibilities
//! - Connect to the broker with a persistent session and a retained
//!   `offline` last will
//! - Subscribe to `{base}/{device}/commands` for inbound `command` and
//!   `heartbeatAck` messages
//! - Publish `commandAck` and `heartbeat` to `{base}/{device}/events`
//! - Decode and encode [`ChannelMessage`](sporekeeper_domain::command::ChannelMessage)
//!   payloads as JSON
//!
//! ## Dependency rule
//! Same as other adapters: depends on `sporekeeper-app` and `sporekeeper-domain`.

pub mod config;
pub mod error;
pub mod topics;
pub mod transport;

pub use config::MqttConfig;
pub use error::MqttError;
pub use transport::MqttTransport;
