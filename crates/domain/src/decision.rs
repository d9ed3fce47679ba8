//! Decision: immutable audit record of one controller evaluation that
//! changed (or deliberately held) actuator targets.
//!
//! A decision carries the full input snapshot that produced it so that any
//! recorded control history can be replayed against the rule evaluator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::actuator::Actuator;
use crate::id::{CommandId, DecisionId, DeviceId};
use crate::phase::Phase;
use crate::reading::Metric;
use crate::rule::Rule;
use crate::time::Timestamp;

/// Latest usable value of one metric as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotValue {
    pub value: f64,
    pub timestamp: Timestamp,
}

/// Everything the controller looked at when it decided.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub readings: BTreeMap<Metric, SnapshotValue>,
    pub actuators: BTreeMap<Actuator, bool>,
}

/// Why an override stopped applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    Released,
}

/// The rule or event that produced a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionCause {
    /// A threshold rule changed its latch.
    Threshold { rule: Rule, value: f64, bound: f64 },
    /// An override forced an actuator.
    OverrideSet {
        actuator: Actuator,
        on: bool,
        until: Timestamp,
        command_id: Option<CommandId>,
    },
    /// An override ended and automation took the actuator back.
    OverrideReleased {
        actuator: Actuator,
        reason: ReleaseReason,
    },
    /// A metric went stale past its grace window.
    FailSafe { metric: Metric, stale_for_secs: i64 },
    /// A metric became fresh again after a fail-safe.
    FailSafeCleared { metric: Metric },
    /// The operator selected a different phase.
    PhaseChanged { from: Phase, to: Phase },
    /// Durable storage failed and the controller fell back to safe defaults.
    ProtectedMode { reason: String },
    /// Storage accepted writes again and normal control resumed.
    ProtectedModeCleared,
}

/// One actuator target change carried by a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorChange {
    pub actuator: Actuator,
    pub from: bool,
    pub to: bool,
}

/// Immutable, append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: DecisionId,
    pub device_id: DeviceId,
    pub timestamp: Timestamp,
    pub phase: Phase,
    pub inputs: InputSnapshot,
    pub cause: DecisionCause,
    pub changes: Vec<ActuatorChange>,
    /// Set for decisions an operator should be alerted about.
    pub alert: bool,
}

impl Decision {
    /// Create a builder for constructing a [`Decision`].
    #[must_use]
    pub fn builder(device_id: DeviceId, cause: DecisionCause) -> DecisionBuilder {
        DecisionBuilder {
            id: None,
            device_id,
            timestamp: None,
            phase: Phase::default(),
            inputs: InputSnapshot::default(),
            cause,
            changes: Vec::new(),
            alert: false,
        }
    }

    /// Change for `actuator`, if this decision moved it.
    #[must_use]
    pub fn change_for(&self, actuator: Actuator) -> Option<&ActuatorChange> {
        self.changes.iter().find(|c| c.actuator == actuator)
    }
}

/// Step-by-step builder for [`Decision`].
#[derive(Debug)]
pub struct DecisionBuilder {
    id: Option<DecisionId>,
    device_id: DeviceId,
    timestamp: Option<Timestamp>,
    phase: Phase,
    inputs: InputSnapshot,
    cause: DecisionCause,
    changes: Vec<ActuatorChange>,
    alert: bool,
}

impl DecisionBuilder {
    #[must_use]
    pub fn id(mut self, id: DecisionId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    #[must_use]
    pub fn inputs(mut self, inputs: InputSnapshot) -> Self {
        self.inputs = inputs;
        self
    }

    /// Record a target change. No-op changes are skipped.
    #[must_use]
    pub fn change(mut self, actuator: Actuator, from: bool, to: bool) -> Self {
        if from != to {
            self.changes.push(ActuatorChange { actuator, from, to });
        }
        self
    }

    #[must_use]
    pub fn alert(mut self, alert: bool) -> Self {
        self.alert = alert;
        self
    }

    /// Consume the builder and return a [`Decision`].
    #[must_use]
    pub fn build(self) -> Decision {
        Decision {
            id: self.id.unwrap_or_default(),
            device_id: self.device_id,
            timestamp: self.timestamp.unwrap_or_else(crate::time::now),
            phase: self.phase,
            inputs: self.inputs,
            cause: self.cause,
            changes: self.changes,
            alert: self.alert,
        }
    }
}
