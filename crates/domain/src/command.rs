//! Commands and the command/heartbeat channel wire messages.
//!
//! Every inbound command carries an idempotency key. Receivers record the key
//! and acknowledge duplicates without applying them again, so one key yields at
//! most one actuator side-effect.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::actuator::Actuator;
use crate::error::{ProtocolFault, ValidationError};
use crate::id::CommandId;
use crate::phase::Phase;
use crate::time::Timestamp;

/// What a command asks the device to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandKind {
    /// Force `actuator` to `state` for `ttl_secs`.
    SetOverride {
        actuator: Actuator,
        state: bool,
        ttl_secs: u64,
    },
    /// Hand `actuator` back to automation immediately.
    ReleaseOverride { actuator: Actuator },
    /// Select the active cultivation phase.
    SetPhase { phase: Phase },
    /// Forget the stored network and re-enter provisioning.
    ResetConnectivity,
}

impl CommandKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetOverride { .. } => "set_override",
            Self::ReleaseOverride { .. } => "release_override",
            Self::SetPhase { .. } => "set_phase",
            Self::ResetConnectivity => "reset_connectivity",
        }
    }

    /// Check payload invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ZeroTtl`] for an override without a lifetime.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::SetOverride { ttl_secs: 0, .. } => Err(ValidationError::ZeroTtl),
            _ => Ok(()),
        }
    }
}

/// Where a command is in its local lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Received,
    Applied,
    Duplicate,
    Rejected,
    /// Lost before the controller saw it, e.g. evicted from a full queue.
    /// Never applied, so a redelivery of the same key is processed again.
    Dropped,
}

impl DeliveryState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Rejected => "rejected",
            Self::Dropped => "dropped",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "applied" => Ok(Self::Applied),
            "duplicate" => Ok(Self::Duplicate),
            "rejected" => Ok(Self::Rejected),
            "dropped" => Ok(Self::Dropped),
            other => Err(ValidationError::UnknownName {
                kind: "delivery state",
                value: other.to_string(),
            }),
        }
    }
}

/// A command as tracked on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub idempotency_key: String,
    pub kind: CommandKind,
    pub received_at: Timestamp,
    pub delivery_state: DeliveryState,
}

impl Command {
    /// Track a freshly received command.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the key is empty or the payload is
    /// invalid.
    pub fn received(
        id: CommandId,
        idempotency_key: impl Into<String>,
        kind: CommandKind,
        at: Timestamp,
    ) -> Result<Self, ValidationError> {
        let idempotency_key = idempotency_key.into();
        if idempotency_key.trim().is_empty() {
            return Err(ValidationError::Empty {
                field: "idempotency_key",
            });
        }
        kind.validate()?;
        Ok(Self {
            id,
            idempotency_key,
            kind,
            received_at: at,
            delivery_state: DeliveryState::Received,
        })
    }

    /// A locally issued command (diagnostic interface). The key is the id.
    #[must_use]
    pub fn local(kind: CommandKind, at: Timestamp) -> Self {
        let id = CommandId::new();
        Self {
            id,
            idempotency_key: id.to_string(),
            kind,
            received_at: at,
            delivery_state: DeliveryState::Received,
        }
    }
}

/// Messages exchanged over the command/heartbeat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelMessage {
    Command {
        id: CommandId,
        idempotency_key: String,
        command: CommandKind,
    },
    CommandAck {
        id: CommandId,
        idempotency_key: String,
        status: DeliveryState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Heartbeat {
        seq: u64,
        sent_at: Timestamp,
    },
    HeartbeatAck {
        seq: u64,
    },
}

impl ChannelMessage {
    /// Decode a wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolFault::Malformed`] when the payload is not a valid
    /// message.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolFault> {
        serde_json::from_slice(bytes).map_err(|err| ProtocolFault::Malformed(err.to_string()))
    }

    /// Encode to a wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolFault::Malformed`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolFault> {
        serde_json::to_vec(self).map_err(|err| ProtocolFault::Malformed(err.to_string()))
    }

    /// Acknowledgement for `command` in its current delivery state.
    #[must_use]
    pub fn ack(command: &Command, reason: Option<String>) -> Self {
        Self::CommandAck {
            id: command.id,
            idempotency_key: command.idempotency_key.clone(),
            status: command.delivery_state,
            reason,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::CommandAck { .. } => "commandAck",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeatAck",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now;

    #[test]
    fn should_decode_override_command_from_wire() {
        let id = CommandId::new();
        let payload = serde_json::json!({
            "type": "command",
            "id": id.to_string(),
            "idempotency_key": "op-17",
            "command": {
                "action": "set_override",
                "actuator": "humidifier",
                "state": true,
                "ttl_secs": 300
            }
        });
        let bytes = serde_json::to_vec(&payload).unwrap();

        let msg = ChannelMessage::decode(&bytes).unwrap();

        assert_eq!(
            msg,
            ChannelMessage::Command {
                id,
                idempotency_key: "op-17".to_string(),
                command: CommandKind::SetOverride {
                    actuator: Actuator::Humidifier,
                    state: true,
                    ttl_secs: 300,
                },
            }
        );
    }

    #[test]
    fn should_use_camel_case_type_tags() {
        let msg = ChannelMessage::HeartbeatAck { seq: 4 };
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "heartbeatAck");
        assert_eq!(msg.type_name(), "heartbeatAck");
    }

    #[test]
    fn should_return_protocol_fault_when_payload_malformed() {
        let err = ChannelMessage::decode(b"{\"type\":\"launch\"}").unwrap_err();
        assert!(matches!(err, ProtocolFault::Malformed(_)));
    }

    #[test]
    fn should_reject_override_without_ttl() {
        let kind = CommandKind::SetOverride {
            actuator: Actuator::ExhaustFan,
            state: true,
            ttl_secs: 0,
        };
        let result = Command::received(CommandId::new(), "k", kind, now());
        assert_eq!(result, Err(ValidationError::ZeroTtl));
    }

    #[test]
    fn should_reject_blank_idempotency_key() {
        let result = Command::received(
            CommandId::new(),
            "  ",
            CommandKind::ResetConnectivity,
            now(),
        );
        assert!(matches!(result, Err(ValidationError::Empty { .. })));
    }

    #[test]
    fn should_build_ack_from_command_state() {
        let mut cmd = Command::local(
            CommandKind::SetPhase {
                phase: Phase::Fruiting,
            },
            now(),
        );
        cmd.delivery_state = DeliveryState::Duplicate;

        let ack = ChannelMessage::ack(&cmd, None);

        assert!(matches!(
            ack,
            ChannelMessage::CommandAck {
                status: DeliveryState::Duplicate,
                ..
            }
        ));
    }
}
