//! Actuators: the fixed set of chamber outputs and their long-lived state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::{DecisionId, TransitionId};
use crate::time::Timestamp;

/// A physical output of the chamber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    ExhaustFan,
    Humidifier,
    Heater,
}

impl Actuator {
    /// Every actuator, in a stable order.
    pub const ALL: [Self; 3] = [Self::ExhaustFan, Self::Humidifier, Self::Heater];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExhaustFan => "exhaust_fan",
            Self::Humidifier => "humidifier",
            Self::Heater => "heater",
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actuator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exhaust_fan" => Ok(Self::ExhaustFan),
            "humidifier" => Ok(Self::Humidifier),
            "heater" => Ok(Self::Heater),
            other => Err(ValidationError::UnknownName {
                kind: "actuator",
                value: other.to_string(),
            }),
        }
    }
}

/// Who asked for an actuator change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSource {
    #[default]
    Automation,
    Manual,
    RemoteOverride,
}

impl ControlSource {
    /// Higher wins when intents conflict.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Automation => 0,
            Self::Manual | Self::RemoteOverride => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automation => "automation",
            Self::Manual => "manual",
            Self::RemoteOverride => "remote_override",
        }
    }
}

impl fmt::Display for ControlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one actuator. One instance per actuator, mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorState {
    pub actuator: Actuator,
    pub on: bool,
    pub last_changed_at: Timestamp,
    pub source: ControlSource,
}

impl ActuatorState {
    /// Initial state of an actuator that has never been driven.
    #[must_use]
    pub fn off(actuator: Actuator, at: Timestamp) -> Self {
        Self {
            actuator,
            on: false,
            last_changed_at: at,
            source: ControlSource::Automation,
        }
    }

    /// Apply a physical change, returning the journaled transition record.
    ///
    /// Returns `None` when `on` already matches.
    pub fn apply(
        &mut self,
        on: bool,
        source: ControlSource,
        decision_id: Option<DecisionId>,
        at: Timestamp,
    ) -> Option<ActuatorTransition> {
        if self.on == on {
            return None;
        }
        let transition = ActuatorTransition {
            id: TransitionId::new(),
            actuator: self.actuator,
            from: self.on,
            to: on,
            source,
            decision_id,
            at,
        };
        self.on = on;
        self.source = source;
        self.last_changed_at = at;
        Some(transition)
    }
}

/// Journaled record of one physical actuator change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorTransition {
    pub id: TransitionId,
    pub actuator: Actuator,
    pub from: bool,
    pub to: bool,
    pub source: ControlSource,
    pub decision_id: Option<DecisionId>,
    pub at: Timestamp,
}
