//! Connectivity lifecycle: the provisioning/reachability state graph.
//!
//! ```text
//! Unprovisioned ─► Provisioning ─► Associating ─► Connected ◄─► Degraded
//!                                      │  ▲          │  ▲          │
//!                                      │  │          ▼  │          │
//!                                      └──┴──────► Fallback ◄──────┘
//! ```
//!
//! Every state may return to `Unprovisioned`, but only through
//! [`ConnectivitySession::reset`]. No other path skips a state: in particular
//! `Associating` is never reached from `Unprovisioned` without passing through
//! `Provisioning`.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TransitionError, ValidationError};
use crate::time::Timestamp;

/// How many transitions the in-memory session keeps; the durable log keeps all.
pub const HISTORY_LIMIT: usize = 64;

/// Network/provisioning state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    #[default]
    Unprovisioned,
    Provisioning,
    Associating,
    Connected,
    Degraded,
    Fallback,
}

impl ConnectivityState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Provisioning => "provisioning",
            Self::Associating => "associating",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Fallback => "fallback",
        }
    }

    /// Whether the graph has a regular edge `self -> next`.
    ///
    /// Returning to `Unprovisioned` is not a regular edge; see
    /// [`ConnectivitySession::reset`].
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectivityState::{
            Associating, Connected, Degraded, Fallback, Provisioning, Unprovisioned,
        };
        matches!(
            (self, next),
            (Unprovisioned, Provisioning)
                | (Provisioning | Fallback, Associating)
                | (Associating | Degraded | Fallback, Connected)
                | (Connected, Degraded)
                | (Associating | Connected | Degraded, Fallback)
        )
    }

    /// Whether the remote service is reachable enough to push data.
    #[must_use]
    pub fn is_online(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Whether a local provisioning channel should be open in this state.
    #[must_use]
    pub fn serves_provisioning(self) -> bool {
        matches!(self, Self::Provisioning | Self::Fallback)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectivityState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprovisioned" => Ok(Self::Unprovisioned),
            "provisioning" => Ok(Self::Provisioning),
            "associating" => Ok(Self::Associating),
            "connected" => Ok(Self::Connected),
            "degraded" => Ok(Self::Degraded),
            "fallback" => Ok(Self::Fallback),
            other => Err(ValidationError::UnknownName {
                kind: "connectivity state",
                value: other.to_string(),
            }),
        }
    }
}

/// One timestamped edge taken by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityTransition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
    pub at: Timestamp,
    /// Short human-readable cause (e.g. `"health probe failed 3 times"`).
    pub reason: String,
}

/// Current connectivity state plus its recent transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivitySession {
    state: ConnectivityState,
    since: Timestamp,
    history: VecDeque<ConnectivityTransition>,
}

impl ConnectivitySession {
    /// Start a session at boot.
    ///
    /// A device with stored credentials starts in `Associating`; one without
    /// starts in `Unprovisioned`. Neither is recorded as a transition.
    #[must_use]
    pub fn start(provisioned: bool, at: Timestamp) -> Self {
        let state = if provisioned {
            ConnectivityState::Associating
        } else {
            ConnectivityState::Unprovisioned
        };
        Self {
            state,
            since: at,
            history: VecDeque::new(),
        }
    }

    /// Rebuild a session from persisted history (oldest first).
    #[must_use]
    pub fn with_history(mut self, history: Vec<ConnectivityTransition>) -> Self {
        let skip = history.len().saturating_sub(HISTORY_LIMIT);
        self.history = history.into_iter().skip(skip).collect();
        self
    }

    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// When the current state was entered.
    #[must_use]
    pub fn since(&self) -> Timestamp {
        self.since
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ConnectivityTransition> {
        self.history.iter()
    }

    /// Take a regular edge of the graph.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Connectivity`] when the edge does not exist.
    pub fn transition(
        &mut self,
        to: ConnectivityState,
        at: Timestamp,
        reason: impl Into<String>,
    ) -> Result<ConnectivityTransition, TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError::Connectivity {
                from: self.state,
                to,
            });
        }
        Ok(self.record(to, at, reason.into()))
    }

    /// Explicit reset: forget the network and return to `Unprovisioned`.
    pub fn reset(&mut self, at: Timestamp) -> ConnectivityTransition {
        self.record(ConnectivityState::Unprovisioned, at, "reset".to_string())
    }

    fn record(
        &mut self,
        to: ConnectivityState,
        at: Timestamp,
        reason: String,
    ) -> ConnectivityTransition {
        let transition = ConnectivityTransition {
            from: self.state,
            to,
            at,
            reason,
        };
        self.state = to;
        self.since = at;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now;

    use ConnectivityState::{
        Associating, Connected, Degraded, Fallback, Provisioning, Unprovisioned,
    };

    #[test]
    fn should_start_unprovisioned_when_no_credentials_stored() {
        let session = ConnectivitySession::start(false, now());
        assert_eq!(session.state(), Unprovisioned);
        assert_eq!(session.history().count(), 0);
    }

    #[test]
    fn should_start_associating_when_credentials_stored() {
        let session = ConnectivitySession::start(true, now());
        assert_eq!(session.state(), Associating);
    }

    #[test]
    fn should_walk_happy_path_and_record_history() {
        let mut session = ConnectivitySession::start(false, now());
        for next in [Provisioning, Associating, Connected, Degraded, Connected] {
            session.transition(next, now(), "test").unwrap();
        }
        assert_eq!(session.state(), Connected);
        assert_eq!(session.history().count(), 5);
    }

    #[test]
    fn should_reject_associating_directly_from_unprovisioned() {
        let mut session = ConnectivitySession::start(false, now());
        let err = session.transition(Associating, now(), "skip").unwrap_err();
        assert_eq!(
            err,
            TransitionError::Connectivity {
                from: Unprovisioned,
                to: Associating
            }
        );
        assert_eq!(session.state(), Unprovisioned);
    }

    #[test]
    fn should_not_allow_unprovisioned_as_regular_edge() {
        for from in [Provisioning, Associating, Connected, Degraded, Fallback] {
            assert!(!from.can_transition_to(Unprovisioned));
        }
    }

    #[test]
    fn should_return_to_unprovisioned_on_reset() {
        let mut session = ConnectivitySession::start(true, now());
        session.transition(Connected, now(), "probe ok").unwrap();
        let t = session.reset(now());
        assert_eq!(t.from, Connected);
        assert_eq!(session.state(), Unprovisioned);
    }

    #[test]
    fn should_only_return_from_fallback_to_connected_or_associating() {
        assert!(Fallback.can_transition_to(Connected));
        assert!(Fallback.can_transition_to(Associating));
        assert!(!Fallback.can_transition_to(Degraded));
        assert!(!Fallback.can_transition_to(Provisioning));
    }

    #[test]
    fn should_cap_in_memory_history() {
        let mut session = ConnectivitySession::start(true, now());
        session.transition(Connected, now(), "up").unwrap();
        for _ in 0..HISTORY_LIMIT {
            session.transition(Degraded, now(), "down").unwrap();
            session.transition(Connected, now(), "up").unwrap();
        }
        assert_eq!(session.history().count(), HISTORY_LIMIT);
    }

    #[test]
    fn should_serve_provisioning_only_when_provisioning_or_fallback() {
        assert!(Provisioning.serves_provisioning());
        assert!(Fallback.serves_provisioning());
        assert!(!Connected.serves_provisioning());
    }
}
