//! Actuator service: the single writer of actuator state.
//!
//! Targets requested by the controller are applied through the
//! [`ActuatorDriver`] while respecting a minimum dwell time in each state. A
//! change requested too early is deferred (only the latest request is kept)
//! and applied once the dwell elapses. Driver faults are retried with backoff
//! and never stop control.
//!
//! Durable writes are gathered into a [`WriteSession`] that the caller
//! collects with [`ActuatorService::take_writes`] once its unit of work ends.
//! In protected mode switches still happen but nothing is written.

use std::collections::BTreeMap;
use std::time::Duration;

use sporekeeper_domain::actuator::{Actuator, ActuatorState, ActuatorTransition, ControlSource};
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::id::DecisionId;
use sporekeeper_domain::time::{Timestamp, span};

use crate::backoff::Backoff;
use crate::ports::{ActuatorDriver, ActuatorStateRepository, Journal};
use crate::state::{ControlMode, StateHolder, WriteSession};

/// Dwell and retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorSettings {
    /// Minimum time an actuator stays on before it may switch off.
    pub min_on: Duration,
    /// Minimum time an actuator stays off before it may switch on.
    pub min_off: Duration,
    pub retry: Backoff,
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self {
            min_on: Duration::from_secs(30),
            min_off: Duration::from_secs(30),
            retry: Backoff::new(Duration::from_secs(2), Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingChange {
    on: bool,
    source: ControlSource,
    decision_id: Option<DecisionId>,
}

#[derive(Debug)]
struct Slot {
    state: ActuatorState,
    pending: Option<PendingChange>,
    faults: u32,
    retry_at: Option<Timestamp>,
}

/// Applies actuator targets, debounced and retried.
pub struct ActuatorService<D, R, J> {
    driver: D,
    repo: R,
    journal: J,
    state: StateHolder,
    settings: ActuatorSettings,
    slots: BTreeMap<Actuator, Slot>,
    writes: WriteSession,
}

impl<D, R, J> ActuatorService<D, R, J>
where
    D: ActuatorDriver,
    R: ActuatorStateRepository,
    J: Journal,
{
    /// Load persisted actuator states and re-assert them on the driver.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted states cannot be read.
    pub async fn restore(
        driver: D,
        repo: R,
        journal: J,
        state: StateHolder,
        settings: ActuatorSettings,
        now: Timestamp,
    ) -> Result<Self, SporeKeeperError> {
        let mut persisted: BTreeMap<Actuator, ActuatorState> = repo
            .load_all()
            .await?
            .into_iter()
            .map(|s| (s.actuator, s))
            .collect();

        let mut slots = BTreeMap::new();
        for actuator in Actuator::ALL {
            let current = persisted
                .remove(&actuator)
                .unwrap_or_else(|| ActuatorState::off(actuator, now));
            slots.insert(
                actuator,
                Slot {
                    state: current,
                    pending: None,
                    faults: 0,
                    retry_at: None,
                },
            );
        }

        let service = Self {
            driver,
            repo,
            journal,
            state,
            settings,
            slots,
            writes: WriteSession::default(),
        };
        service.reassert().await;
        service.publish_all();
        Ok(service)
    }

    async fn reassert(&self) {
        for slot in self.slots.values() {
            let actuator = slot.state.actuator;
            if let Err(err) = self.driver.apply(actuator, slot.state.on).await {
                tracing::warn!(%err, %actuator, on = slot.state.on, "failed to re-assert persisted actuator state");
            }
        }
    }

    /// Current state of every actuator.
    #[must_use]
    pub fn states(&self) -> BTreeMap<Actuator, bool> {
        self.slots
            .iter()
            .map(|(a, slot)| (*a, slot.state.on))
            .collect()
    }

    /// Whether a change for `actuator` is waiting on dwell or retry.
    #[must_use]
    pub fn has_pending(&self, actuator: Actuator) -> bool {
        self.slots
            .get(&actuator)
            .is_some_and(|slot| slot.pending.is_some())
    }

    /// Durable writes made since the last call.
    pub fn take_writes(&mut self) -> WriteSession {
        std::mem::take(&mut self.writes)
    }

    /// Save every actuator's current state, e.g. after writes were skipped.
    pub async fn persist_states(&mut self) {
        for slot in self.slots.values() {
            let result = self.repo.save(slot.state.clone()).await;
            if let Err(err) = &result {
                tracing::error!(%err, actuator = %slot.state.actuator, "failed to save actuator state");
            }
            self.writes.record(&result);
        }
    }

    /// Request a new target. Applied now, or deferred until dwell allows.
    pub async fn set_target(
        &mut self,
        actuator: Actuator,
        on: bool,
        source: ControlSource,
        decision_id: Option<DecisionId>,
        now: Timestamp,
    ) {
        let Some(slot) = self.slots.get_mut(&actuator) else {
            return;
        };
        if slot.state.on == on {
            // Back to the current state before a deferred change landed.
            slot.pending = None;
            slot.retry_at = None;
            return;
        }
        slot.pending = Some(PendingChange {
            on,
            source,
            decision_id,
        });
        self.try_apply(actuator, now).await;
    }

    /// Apply deferred changes whose dwell or retry delay has elapsed.
    pub async fn tick(&mut self, now: Timestamp) {
        for actuator in Actuator::ALL {
            self.try_apply(actuator, now).await;
        }
    }

    async fn try_apply(&mut self, actuator: Actuator, now: Timestamp) {
        let Some(slot) = self.slots.get(&actuator) else {
            return;
        };
        let Some(pending) = slot.pending else {
            return;
        };
        if slot.retry_at.is_some_and(|at| now < at) {
            return;
        }
        let dwell = if slot.state.on {
            self.settings.min_on
        } else {
            self.settings.min_off
        };
        if now - slot.state.last_changed_at < span(dwell) {
            tracing::debug!(%actuator, target = pending.on, "change deferred by dwell time");
            return;
        }

        let result = self.driver.apply(actuator, pending.on).await;

        let Some(slot) = self.slots.get_mut(&actuator) else {
            return;
        };
        match result {
            Ok(()) => {
                slot.pending = None;
                slot.faults = 0;
                slot.retry_at = None;
                let transition =
                    slot.state
                        .apply(pending.on, pending.source, pending.decision_id, now);
                let current = slot.state.clone();
                if let Some(transition) = transition {
                    tracing::info!(
                        %actuator,
                        on = transition.to,
                        source = %transition.source,
                        "actuator switched"
                    );
                    self.persist(&transition, current).await;
                }
            }
            Err(err) => {
                let attempt = slot.faults;
                slot.faults += 1;
                slot.retry_at = Some(now + span(self.settings.retry.delay(attempt)));
                tracing::warn!(%err, %actuator, target = pending.on, attempt = slot.faults, "actuator fault, will retry");
                self.state.update(|s| s.faults.actuator_faults += 1);
            }
        }
    }

    async fn persist(&mut self, transition: &ActuatorTransition, current: ActuatorState) {
        if self.state.mode() == ControlMode::Normal {
            let journaled = self.journal.append_transition(transition).await;
            let saved = self.repo.save(current.clone()).await;
            let result = journaled.and(saved);
            if let Err(err) = &result {
                tracing::error!(%err, actuator = %current.actuator, "failed to persist actuator transition");
            }
            self.writes.record(&result);
        }
        self.state.update(|s| {
            s.actuators.insert(current.actuator, current);
        });
    }

    fn publish_all(&self) {
        let states: Vec<ActuatorState> = self.slots.values().map(|s| s.state.clone()).collect();
        self.state.update(|s| {
            for st in states {
                s.actuators.insert(st.actuator, st);
            }
        });
    }
}
