//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into
//! [`SporeKeeperError`] via `From`. The variants follow the fault taxonomy of
//! the edge agent: sensor, actuator, storage, network and protocol faults are
//! kept apart so callers can decide locally whether a fault is contained,
//! retried or fatal for the current storage session.

use crate::actuator::Actuator;
use crate::connectivity::ConnectivityState;
use crate::reading::Metric;

/// Top-level error type shared by every crate.
#[derive(Debug, thiserror::Error)]
pub enum SporeKeeperError {
    /// A domain invariant was violated by caller-supplied data.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A referenced record does not exist.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// A state machine was asked to take an edge that is not in its graph.
    #[error("illegal transition")]
    Transition(#[from] TransitionError),

    /// A sensor could not produce a usable reading.
    #[error("sensor fault")]
    Sensor(#[from] SensorFault),

    /// An actuator did not reach the commanded state.
    #[error("actuator fault")]
    Actuator(#[from] ActuatorFault),

    /// A durable write or read failed.
    #[error("storage error")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The remote service or broker could not be reached.
    #[error("network error")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A remote payload could not be understood.
    #[error("protocol error")]
    Protocol(#[from] ProtocolFault),
}

impl SporeKeeperError {
    /// Whether the operation that produced this error may succeed if retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Actuator(_))
    }

    /// Wrap any error as a [`SporeKeeperError::Network`].
    pub fn network(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Network(Box::new(err))
    }

    /// Wrap any error as a [`SporeKeeperError::Storage`].
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(err))
    }
}

/// Domain invariant violations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("network name must not be empty")]
    MissingNetworkName,

    #[error("network name must be at most 32 printable ASCII bytes")]
    InvalidNetworkName,

    #[error("passphrase must be empty (open network) or 8 to 64 bytes")]
    InvalidPassphrase,

    #[error("threshold band for {metric} is invalid: min {min} must be below max {max}")]
    InvertedBand { metric: Metric, min: f64, max: f64 },

    #[error("hysteresis for {metric} must be non-negative and narrower than the band")]
    InvalidHysteresis { metric: Metric },

    #[error("reading value must be finite")]
    NonFiniteValue,

    #[error("override ttl must be positive")]
    ZeroTtl,

    #[error("time range start must not be after its end")]
    InvertedRange,

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("unknown {kind} {value:?}")]
    UnknownName { kind: &'static str, value: String },
}

/// Returned when a looked-up record does not exist.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{entity} {id} not found")]
pub struct NotFoundError {
    pub entity: &'static str,
    pub id: String,
}

/// Returned when a connectivity or sync state change is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("connectivity cannot move from {from} to {to}")]
    Connectivity {
        from: ConnectivityState,
        to: ConnectivityState,
    },

    #[error("sync record cannot move from {from} to {to}")]
    Sync { from: String, to: String },
}

/// A sensor produced no usable reading.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorFault {
    #[error("{metric} sensor did not answer within the read timeout")]
    Timeout { metric: Metric },

    #[error("{metric} sensor read failed: {reason}")]
    ReadFailed { metric: Metric, reason: String },

    #[error("{metric} has had no valid reading for {seconds}s")]
    Stale { metric: Metric, seconds: i64 },
}

/// An actuator did not reach the commanded state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{actuator} did not reach state {target}: {reason}")]
pub struct ActuatorFault {
    pub actuator: Actuator,
    pub target: bool,
    pub reason: String,
}

/// A remote payload was malformed or violated the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolFault {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unexpected message type {0}")]
    UnexpectedMessage(String),

    #[error("remote response does not match the request: {0}")]
    Mismatch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_not_found_with_entity_and_id() {
        let err = NotFoundError {
            entity: "SyncRecord",
            id: "reading/42".to_string(),
        };
        assert_eq!(err.to_string(), "SyncRecord reading/42 not found");
    }

    #[test]
    fn should_treat_network_and_actuator_faults_as_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(SporeKeeperError::network(io).is_retryable());

        let fault = ActuatorFault {
            actuator: Actuator::Heater,
            target: true,
            reason: "relay stuck".to_string(),
        };
        assert!(SporeKeeperError::from(fault).is_retryable());
    }

    #[test]
    fn should_not_retry_validation_or_protocol_errors() {
        let err: SporeKeeperError = ValidationError::ZeroTtl.into();
        assert!(!err.is_retryable());

        let err: SporeKeeperError = ProtocolFault::Malformed("{".to_string()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn should_describe_illegal_connectivity_transition() {
        let err = TransitionError::Connectivity {
            from: ConnectivityState::Unprovisioned,
            to: ConnectivityState::Associating,
        };
        assert_eq!(
            err.to_string(),
            "connectivity cannot move from unprovisioned to associating"
        );
    }
}
