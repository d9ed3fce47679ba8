//! Sync bookkeeping: the state of each journal entry relative to the remote
//! canonical store.
//!
//! ```text
//!   pending ──► in_flight ──► acked
//!      ▲            │
//!      ├────────────┘ (retry)
//!      │            │
//!      └── dead_letter ◄┘ (attempts exhausted; requeue only)
//! ```
//!
//! `acked` is terminal and immutable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TransitionError, ValidationError};
use crate::time::Timestamp;

/// Kind of journaled entity. Each kind is its own ordered log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Reading,
    Decision,
    ActuatorTransition,
}

impl EntityType {
    pub const ALL: [Self; 3] = [Self::Reading, Self::Decision, Self::ActuatorTransition];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Decision => "decision",
            Self::ActuatorTransition => "actuator_transition",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reading" => Ok(Self::Reading),
            "decision" => Ok(Self::Decision),
            "actuator_transition" => Ok(Self::ActuatorTransition),
            other => Err(ValidationError::UnknownName {
                kind: "entity type",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery state of one journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Pending,
    InFlight,
    Acked,
    DeadLetter,
}

impl SyncState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Acked => "acked",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Whether the graph has an edge `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Acked | Self::Pending | Self::DeadLetter)
                | (Self::DeadLetter, Self::Pending)
        )
    }

    /// Validate an edge.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Sync`] when the edge is not in the graph.
    pub fn transition_to(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Sync {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "acked" => Ok(Self::Acked),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(ValidationError::UnknownName {
                kind: "sync state",
                value: other.to_string(),
            }),
        }
    }
}

/// Bookkeeping for one journal entry, keyed by `(entity_type, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub entity_type: EntityType,
    /// Local sequence id, strictly increasing within one entity type.
    pub sequence: i64,
    /// Client-generated id of the referenced entity; the remote upserts by it.
    pub entity_id: String,
    pub state: SyncState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub recorded_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A journal entry together with its serialized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub record: SyncRecord,
    pub payload: serde_json::Value,
}

/// Per-state totals, used for backlog reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub acked: u64,
    pub dead_letter: u64,
}

impl SyncCounts {
    /// Entries not yet acknowledged remotely.
    #[must_use]
    pub fn backlog(&self) -> u64 {
        self.pending + self.in_flight
    }
}
