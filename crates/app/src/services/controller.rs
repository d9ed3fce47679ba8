//! Automation controller: deterministic threshold/hysteresis control.
//!
//! [`ControlLogic`] is the pure core: given readings, commands and the clock
//! it maintains rule latches, overrides and fail-safe state, and returns the
//! [`Decision`]s that changed actuator targets. It performs no IO, so the
//! same inputs always give the same decisions.
//!
//! [`AutomationController`] is the single serialized loop around it: it pulls
//! from the [`ControlQueue`], journals each decision before acting, hands
//! targets to the [`ActuatorService`] and publishes status snapshots. After
//! a failed write it retries storage with backoff, drops to protected mode
//! once the attempts run out and leaves it when storage accepts writes again.
//!
//! Target precedence per actuator, highest first:
//! 1. protected mode → safe default
//! 2. active override → forced state
//! 3. a rule metric in fail-safe → safe default
//! 4. any latched rule → on, otherwise off

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use sporekeeper_domain::actuator::{Actuator, ControlSource};
use sporekeeper_domain::command::{Command, CommandKind};
use sporekeeper_domain::decision::{
    ActuatorChange, Decision, DecisionCause, InputSnapshot, ReleaseReason, SnapshotValue,
};
use sporekeeper_domain::id::{CommandId, DeviceId};
use sporekeeper_domain::phase::{Phase, PhaseProfile};
use sporekeeper_domain::reading::{Metric, Reading};
use sporekeeper_domain::rule::Rule;
use sporekeeper_domain::time::{Timestamp, now, span};

use crate::backoff::Backoff;
use crate::ports::{ActuatorDriver, ActuatorStateRepository, Journal, SettingsStore};
use crate::queue::{CommandOutcome, ControlInput, ControlQueue, QueuedCommand};
use crate::services::actuator_service::ActuatorService;
use crate::shutdown::Shutdown;
use crate::state::{ControlMode, OverrideStatus, StateHolder, WriteSession};

/// Controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub device_id: DeviceId,
    pub rules: Vec<Rule>,
    pub profiles: BTreeMap<Phase, PhaseProfile>,
    /// A metric with no usable reading for this long is stale.
    pub stale_after: Duration,
    /// How long a stale metric holds last-known state before fail-safe.
    pub grace: Duration,
    /// Overrides asking for longer are clamped to this.
    pub max_override_ttl: Duration,
    pub safe_defaults: BTreeMap<Actuator, bool>,
    /// Failed storage recovery attempts before protected mode.
    pub storage_restart_attempts: u32,
    /// Delay between storage recovery attempts, protected or not.
    pub storage_retry: Backoff,
    pub tick: Duration,
}

impl ControllerSettings {
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            rules: Rule::defaults(),
            profiles: BTreeMap::from([
                (Phase::Spawning, PhaseProfile::default_spawning()),
                (Phase::Fruiting, PhaseProfile::default_fruiting()),
            ]),
            stale_after: Duration::from_secs(120),
            grace: Duration::from_secs(60),
            max_override_ttl: Duration::from_secs(3600),
            safe_defaults: default_safe_states(),
            storage_restart_attempts: 3,
            storage_retry: Backoff::new(Duration::from_secs(2), Duration::from_secs(60)),
            tick: Duration::from_secs(1),
        }
    }

    fn safe_default(&self, actuator: Actuator) -> bool {
        self.safe_defaults.get(&actuator).copied().unwrap_or(false)
    }
}

/// Ventilation on, heating and humidification off.
#[must_use]
pub fn default_safe_states() -> BTreeMap<Actuator, bool> {
    BTreeMap::from([
        (Actuator::ExhaustFan, true),
        (Actuator::Humidifier, false),
        (Actuator::Heater, false),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Override {
    on: bool,
    until: Timestamp,
    source: ControlSource,
}

/// Pure control state machine.
#[derive(Debug)]
pub struct ControlLogic {
    settings: ControllerSettings,
    phase: Phase,
    mode: ControlMode,
    latches: HashMap<Rule, bool>,
    latest: BTreeMap<Metric, SnapshotValue>,
    last_fresh: BTreeMap<Metric, Timestamp>,
    stale_warned: BTreeSet<Metric>,
    fail_safe: BTreeSet<Metric>,
    overrides: BTreeMap<Actuator, Override>,
    targets: BTreeMap<Actuator, bool>,
    started_at: Timestamp,
}

impl ControlLogic {
    /// Start from the current actuator states.
    ///
    /// Rule latches begin at the state of their actuator, so the first
    /// readings resume control from where the device is instead of stepping
    /// every actuator back to off.
    #[must_use]
    pub fn new(
        settings: ControllerSettings,
        phase: Phase,
        current: &BTreeMap<Actuator, bool>,
        started_at: Timestamp,
    ) -> Self {
        let targets: BTreeMap<Actuator, bool> = Actuator::ALL
            .into_iter()
            .map(|a| (a, current.get(&a).copied().unwrap_or(false)))
            .collect();
        let latches = settings
            .rules
            .iter()
            .map(|r| (*r, targets.get(&r.actuator).copied().unwrap_or(false)))
            .collect();
        Self {
            settings,
            phase,
            mode: ControlMode::Normal,
            latches,
            latest: BTreeMap::new(),
            last_fresh: BTreeMap::new(),
            stale_warned: BTreeSet::new(),
            fail_safe: BTreeSet::new(),
            overrides: BTreeMap::new(),
            targets,
            started_at,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    #[must_use]
    pub fn targets(&self) -> &BTreeMap<Actuator, bool> {
        &self.targets
    }

    #[must_use]
    pub fn latest(&self) -> &BTreeMap<Metric, SnapshotValue> {
        &self.latest
    }

    #[must_use]
    pub fn fail_safe_metrics(&self) -> Vec<Metric> {
        self.fail_safe.iter().copied().collect()
    }

    /// Active overrides with their expiry.
    #[must_use]
    pub fn overrides(&self) -> BTreeMap<Actuator, OverrideStatus> {
        self.overrides
            .iter()
            .map(|(a, o)| {
                (
                    *a,
                    OverrideStatus {
                        on: o.on,
                        until: o.until,
                        source: o.source,
                    },
                )
            })
            .collect()
    }

    fn profile(&self) -> Option<&PhaseProfile> {
        self.settings.profiles.get(&self.phase)
    }

    fn snapshot(&self) -> InputSnapshot {
        InputSnapshot {
            readings: self.latest.clone(),
            actuators: self.targets.clone(),
        }
    }

    fn desired(&self, actuator: Actuator) -> bool {
        if self.mode == ControlMode::Protected {
            return self.settings.safe_default(actuator);
        }
        if let Some(o) = self.overrides.get(&actuator) {
            return o.on;
        }
        let mut rules = self
            .settings
            .rules
            .iter()
            .filter(|r| r.actuator == actuator);
        if rules
            .clone()
            .any(|r| self.fail_safe.contains(&r.metric))
        {
            return self.settings.safe_default(actuator);
        }
        let profile = self.profile();
        rules.any(|r| {
            profile.is_some_and(|p| p.band(r.metric).is_some())
                && self.latches.get(r).copied().unwrap_or(false)
        })
    }

    /// Move targets to their desired values, returning what changed.
    fn settle(&mut self) -> Vec<ActuatorChange> {
        let mut changes = Vec::new();
        for actuator in Actuator::ALL {
            let desired = self.desired(actuator);
            let current = self.targets.get(&actuator).copied().unwrap_or(false);
            if desired != current {
                changes.push(ActuatorChange {
                    actuator,
                    from: current,
                    to: desired,
                });
                self.targets.insert(actuator, desired);
            }
        }
        changes
    }

    fn decision(
        &self,
        cause: DecisionCause,
        inputs: InputSnapshot,
        changes: &[ActuatorChange],
        alert: bool,
        now: Timestamp,
    ) -> Decision {
        changes
            .iter()
            .fold(
                Decision::builder(self.settings.device_id.clone(), cause),
                |b, c| b.change(c.actuator, c.from, c.to),
            )
            .phase(self.phase)
            .inputs(inputs)
            .alert(alert)
            .timestamp(now)
            .build()
    }

    /// Evaluate a reading. Invalid readings are ignored.
    pub fn on_reading(&mut self, reading: &Reading, now: Timestamp) -> Option<Decision> {
        if !reading.is_usable() {
            tracing::debug!(metric = %reading.metric, value = reading.value, "ignoring unusable reading");
            return None;
        }
        let metric = reading.metric;
        let inputs = self.snapshot();
        self.latest.insert(
            metric,
            SnapshotValue {
                value: reading.value,
                timestamp: reading.timestamp,
            },
        );
        self.last_fresh.insert(metric, reading.timestamp);
        self.stale_warned.remove(&metric);
        let cleared = self.fail_safe.remove(&metric);

        let band = self.profile().and_then(|p| p.band(metric)).copied();
        let mut fired = Vec::new();
        if let Some(band) = band {
            for rule in self.settings.rules.iter().filter(|r| r.metric == metric) {
                let prev = self.latches.get(rule).copied().unwrap_or(false);
                let next = rule.next_latch(&band, reading.value, prev);
                if next != prev {
                    self.latches.insert(*rule, next);
                    fired.push((*rule, rule.bound(&band)));
                }
            }
        }

        let mut inputs = inputs;
        inputs.readings.insert(
            metric,
            SnapshotValue {
                value: reading.value,
                timestamp: reading.timestamp,
            },
        );
        let changes = self.settle();

        if cleared {
            tracing::info!(%metric, "fresh reading, leaving fail-safe");
            let cause = DecisionCause::FailSafeCleared { metric };
            return Some(self.decision(cause, inputs, &changes, false, now));
        }
        if changes.is_empty() {
            return None;
        }
        let (rule, bound) = fired
            .iter()
            .find(|(r, _)| changes.iter().any(|c| c.actuator == r.actuator))
            .or(fired.first())
            .copied()?;
        let cause = DecisionCause::Threshold {
            rule,
            value: reading.value,
            bound,
        };
        Some(self.decision(cause, inputs, &changes, false, now))
    }

    /// Apply a control command.
    ///
    /// # Errors
    ///
    /// Returns a human-readable rejection reason when the command cannot be
    /// applied in the current state.
    pub fn on_command(
        &mut self,
        command: &Command,
        source: ControlSource,
        now: Timestamp,
    ) -> Result<Option<Decision>, String> {
        match &command.kind {
            CommandKind::SetOverride {
                actuator,
                state,
                ttl_secs,
            } => self.set_override(*actuator, *state, *ttl_secs, source, command.id, now),
            CommandKind::ReleaseOverride { actuator } => {
                if self.overrides.remove(actuator).is_some() {
                    Ok(self.release(*actuator, ReleaseReason::Released, now))
                } else {
                    Ok(None)
                }
            }
            CommandKind::SetPhase { phase } => self.set_phase(*phase, now),
            CommandKind::ResetConnectivity => {
                Err("connectivity reset is not a control command".to_string())
            }
        }
    }

    fn set_override(
        &mut self,
        actuator: Actuator,
        on: bool,
        ttl_secs: u64,
        source: ControlSource,
        command_id: CommandId,
        now: Timestamp,
    ) -> Result<Option<Decision>, String> {
        if self.mode == ControlMode::Protected {
            return Err("controller is in protected mode".to_string());
        }
        if ttl_secs == 0 {
            return Err("override ttl must be positive".to_string());
        }
        let ttl = Duration::from_secs(ttl_secs).min(self.settings.max_override_ttl);
        let until = now + span(ttl);
        let inputs = self.snapshot();
        self.overrides.insert(actuator, Override { on, until, source });
        tracing::info!(%actuator, on, %until, %source, "override set");

        let changes = self.settle();
        if changes.is_empty() {
            return Ok(None);
        }
        let cause = DecisionCause::OverrideSet {
            actuator,
            on,
            until,
            command_id: Some(command_id),
        };
        Ok(Some(self.decision(cause, inputs, &changes, false, now)))
    }

    /// Hand `actuator` back to automation, resuming from the latest reading
    /// with the latches seeded from the actuator's current state.
    fn release(&mut self, actuator: Actuator, reason: ReleaseReason, now: Timestamp) -> Option<Decision> {
        let current = self.targets.get(&actuator).copied().unwrap_or(false);
        let profile = self.profile().cloned();
        for rule in self.settings.rules.iter().filter(|r| r.actuator == actuator) {
            let band = profile.as_ref().and_then(|p| p.band(rule.metric));
            let latch = match (band, self.latest.get(&rule.metric)) {
                (Some(band), Some(v)) => rule.next_latch(band, v.value, current),
                _ => false,
            };
            self.latches.insert(*rule, latch);
        }
        tracing::info!(%actuator, ?reason, "override ended, automation resumes");

        let inputs = self.snapshot();
        let changes = self.settle();
        if changes.is_empty() {
            return None;
        }
        let cause = DecisionCause::OverrideReleased { actuator, reason };
        Some(self.decision(cause, inputs, &changes, false, now))
    }

    fn set_phase(&mut self, phase: Phase, now: Timestamp) -> Result<Option<Decision>, String> {
        if phase == self.phase {
            return Ok(None);
        }
        let Some(profile) = self.settings.profiles.get(&phase).cloned() else {
            return Err(format!("no threshold profile configured for {phase}"));
        };
        let inputs = self.snapshot();
        let from = self.phase;
        self.phase = phase;

        // Re-evaluate every latch against the new bands from current state.
        for rule in &self.settings.rules {
            let current = self.targets.get(&rule.actuator).copied().unwrap_or(false);
            let latch = match (profile.band(rule.metric), self.latest.get(&rule.metric)) {
                (Some(band), Some(v)) => rule.next_latch(band, v.value, current),
                _ => false,
            };
            self.latches.insert(*rule, latch);
        }
        tracing::info!(%from, to = %phase, "phase changed");

        let changes = self.settle();
        let cause = DecisionCause::PhaseChanged { from, to: phase };
        Ok(Some(self.decision(cause, inputs, &changes, false, now)))
    }

    /// Periodic evaluation: override expiry and reading staleness.
    pub fn on_tick(&mut self, now: Timestamp) -> Vec<Decision> {
        let mut decisions = Vec::new();

        let expired: Vec<Actuator> = self
            .overrides
            .iter()
            .filter(|(_, o)| o.until <= now)
            .map(|(a, _)| *a)
            .collect();
        for actuator in expired {
            self.overrides.remove(&actuator);
            decisions.extend(self.release(actuator, ReleaseReason::Expired, now));
        }

        if self.mode == ControlMode::Normal {
            decisions.extend(self.check_staleness(now));
        }
        decisions
    }

    fn check_staleness(&mut self, now: Timestamp) -> Vec<Decision> {
        let Some(profile) = self.profile() else {
            return Vec::new();
        };
        let watched: BTreeSet<Metric> = self
            .settings
            .rules
            .iter()
            .map(|r| r.metric)
            .filter(|m| profile.band(*m).is_some())
            .collect();

        let stale_after = span(self.settings.stale_after);
        let fail_after = stale_after + span(self.settings.grace);
        let mut decisions = Vec::new();
        for metric in watched {
            if self.fail_safe.contains(&metric) {
                continue;
            }
            let last = self
                .last_fresh
                .get(&metric)
                .copied()
                .unwrap_or(self.started_at);
            let age = now - last;
            if age > fail_after {
                self.fail_safe.insert(metric);
                let inputs = self.snapshot();
                let changes = self.settle();
                tracing::warn!(
                    %metric,
                    stale_for_secs = age.num_seconds(),
                    "readings stale past grace window, forcing safe defaults"
                );
                let cause = DecisionCause::FailSafe {
                    metric,
                    stale_for_secs: age.num_seconds(),
                };
                decisions.push(self.decision(cause, inputs, &changes, true, now));
            } else if age > stale_after && self.stale_warned.insert(metric) {
                tracing::warn!(%metric, stale_for_secs = age.num_seconds(), "readings stale, holding last state");
            }
        }
        decisions
    }

    /// Drop to protected minimal-control mode. Returns `None` if already there.
    pub fn enter_protected(&mut self, reason: &str, now: Timestamp) -> Option<Decision> {
        if self.mode == ControlMode::Protected {
            return None;
        }
        let inputs = self.snapshot();
        self.mode = ControlMode::Protected;
        self.overrides.clear();
        let changes = self.settle();
        let cause = DecisionCause::ProtectedMode {
            reason: reason.to_string(),
        };
        Some(self.decision(cause, inputs, &changes, true, now))
    }

    /// Resume normal control. Returns `None` if not protected.
    pub fn leave_protected(&mut self, now: Timestamp) -> Option<Decision> {
        if self.mode != ControlMode::Protected {
            return None;
        }
        let inputs = self.snapshot();
        self.mode = ControlMode::Normal;
        let changes = self.settle();
        let cause = DecisionCause::ProtectedModeCleared;
        Some(self.decision(cause, inputs, &changes, false, now))
    }
}

/// Storage recovery attempts since the last healthy write.
#[derive(Debug, Default)]
struct StorageRecovery {
    attempts: u32,
    next_attempt: Option<Timestamp>,
}

/// The serialized automation loop.
pub struct AutomationController<J, D, R, S> {
    logic: ControlLogic,
    actuators: ActuatorService<D, R, J>,
    journal: J,
    settings_store: S,
    queue: ControlQueue,
    state: StateHolder,
    tick: Duration,
    storage_restart_attempts: u32,
    storage_retry: Backoff,
    recovery: StorageRecovery,
    writes: WriteSession,
}

impl<J, D, R, S> AutomationController<J, D, R, S>
where
    J: Journal,
    D: ActuatorDriver,
    R: ActuatorStateRepository,
    S: SettingsStore,
{
    /// Create a controller resuming from the actuator service's current states.
    pub fn new(
        settings: ControllerSettings,
        phase: Phase,
        actuators: ActuatorService<D, R, J>,
        journal: J,
        settings_store: S,
        queue: ControlQueue,
        state: StateHolder,
    ) -> Self {
        let tick = settings.tick;
        let storage_restart_attempts = settings.storage_restart_attempts;
        let storage_retry = settings.storage_retry;
        let logic = ControlLogic::new(settings, phase, &actuators.states(), now());
        let controller = Self {
            logic,
            actuators,
            journal,
            settings_store,
            queue,
            state,
            tick,
            storage_restart_attempts,
            storage_retry,
            recovery: StorageRecovery::default(),
            writes: WriteSession::default(),
        };
        controller.publish();
        controller
    }

    #[must_use]
    pub fn logic(&self) -> &ControlLogic {
        &self.logic
    }

    #[must_use]
    pub fn actuators(&self) -> &ActuatorService<D, R, J> {
        &self.actuators
    }

    /// Run until shutdown or until the queue is closed, then handle whatever
    /// is still queued so every waiting command gets its reply.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let queue = self.queue.clone();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(phase = %self.logic.phase(), "automation controller started");

        loop {
            tokio::select! {
                biased;
                () = shutdown.wait() => break,
                input = queue.pop() => match input {
                    Some(input) => self.handle(input, now()).await,
                    None => break,
                },
                _ = ticker.tick() => self.tick(now()).await,
            }
        }

        queue.close();
        let mut drained = 0_usize;
        while let Some(input) = queue.try_pop() {
            self.handle(input, now()).await;
            drained += 1;
        }
        tracing::info!(drained, "automation controller stopped");
    }

    /// Process one queued input.
    pub async fn handle(&mut self, input: ControlInput, now: Timestamp) {
        match input {
            ControlInput::Reading(reading) => {
                if let Some(decision) = self.logic.on_reading(&reading, now) {
                    self.commit(decision, ControlSource::Automation, now).await;
                }
            }
            ControlInput::Command(queued) => self.handle_command(queued, now).await,
        }
        self.finish_writes();
        self.check_storage(now).await;
        self.publish();
    }

    async fn handle_command(&mut self, queued: QueuedCommand, now: Timestamp) {
        let QueuedCommand {
            command,
            source,
            reply,
        } = queued;
        let outcome = match self.logic.on_command(&command, source, now) {
            Ok(decision) => {
                if let CommandKind::SetPhase { phase } = command.kind {
                    self.persist_phase(phase).await;
                }
                if let Some(decision) = decision {
                    let change_source = match command.kind {
                        CommandKind::SetOverride { .. } => source,
                        _ => ControlSource::Automation,
                    };
                    self.commit(decision, change_source, now).await;
                }
                CommandOutcome::applied()
            }
            Err(reason) => {
                tracing::warn!(command = command.kind.name(), %reason, "command rejected");
                CommandOutcome::rejected(reason)
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    /// Periodic work: override expiry, staleness, deferred actuator changes.
    pub async fn tick(&mut self, now: Timestamp) {
        for decision in self.logic.on_tick(now) {
            self.commit(decision, ControlSource::Automation, now).await;
        }
        self.actuators.tick(now).await;
        self.finish_writes();
        self.check_storage(now).await;
        self.publish();
    }

    /// Journal the decision, then drive the actuators it changed.
    async fn commit(&mut self, decision: Decision, source: ControlSource, now: Timestamp) {
        if decision.alert {
            tracing::warn!(cause = ?decision.cause, changes = decision.changes.len(), "alert decision");
        } else {
            tracing::info!(cause = ?decision.cause, changes = decision.changes.len(), "decision");
        }

        if self.logic.mode() == ControlMode::Normal {
            let result = self.journal.append_decision(&decision).await;
            if let Err(err) = &result {
                tracing::error!(%err, decision = %decision.id, "failed to journal decision");
            }
            self.writes.record(&result);
        }

        for change in &decision.changes {
            self.actuators
                .set_target(change.actuator, change.to, source, Some(decision.id), now)
                .await;
        }
    }

    async fn persist_phase(&mut self, phase: Phase) {
        let result = self.settings_store.save_phase(phase).await;
        if let Err(err) = &result {
            tracing::error!(%err, %phase, "failed to persist phase");
        }
        self.writes.record(&result);
    }

    /// Count this unit of work's writes as one storage outcome.
    fn finish_writes(&mut self) {
        let mut writes = std::mem::take(&mut self.writes);
        writes.merge(self.actuators.take_writes());
        self.state.finish_write_session(writes);
    }

    /// After a failed write, retry storage on a backoff schedule. Protected
    /// mode once the attempts run out; normal mode once a write succeeds.
    async fn check_storage(&mut self, now: Timestamp) {
        let failures = self.state.read(|s| s.faults.consecutive_storage_failures);
        if failures == 0 && self.logic.mode() == ControlMode::Normal {
            self.recovery = StorageRecovery::default();
            return;
        }
        if self.recovery.next_attempt.is_some_and(|at| now < at) {
            return;
        }

        match self.journal.check_writable().await {
            Ok(()) => {
                tracing::info!(attempts = self.recovery.attempts, "storage accepts writes again");
                self.state.record_storage_success();
                self.recovery = StorageRecovery::default();
                if let Some(decision) = self.logic.leave_protected(now) {
                    tracing::warn!("storage recovered, leaving protected mode");
                    self.publish();
                    self.actuators.persist_states().await;
                    self.commit(decision, ControlSource::Automation, now).await;
                    self.finish_writes();
                }
            }
            Err(err) => {
                let attempt = self.recovery.attempts;
                self.recovery.attempts += 1;
                self.recovery.next_attempt = Some(now + span(self.storage_retry.delay(attempt)));
                self.state.record_storage_failure();
                tracing::error!(%err, attempt = self.recovery.attempts, "storage recovery attempt failed");
                if self.recovery.attempts < self.storage_restart_attempts {
                    return;
                }
                let reason = format!(
                    "storage unrecoverable after {} attempts",
                    self.recovery.attempts
                );
                if let Some(decision) = self.logic.enter_protected(&reason, now) {
                    tracing::error!(%reason, "entering protected minimal-control mode");
                    self.publish();
                    self.commit(decision, ControlSource::Automation, now).await;
                    self.finish_writes();
                }
            }
        }
    }

    fn publish(&self) {
        let phase = self.logic.phase();
        let mode = self.logic.mode();
        let overrides = self.logic.overrides();
        let latest = self.logic.latest().clone();
        let fail_safe = self.logic.fail_safe_metrics();
        let dropped = self.queue.dropped();
        self.state.update(|s| {
            s.phase = phase;
            s.mode = mode;
            s.overrides = overrides;
            s.latest = latest;
            s.fail_safe = fail_safe;
            s.faults.queue_dropped = dropped;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::actuator_service::ActuatorSettings;
    use crate::state::DeviceStatus;
    use crate::testing::{FakeDriver, InMemoryActuatorRepo, InMemoryJournal, InMemorySettings};
    use sporekeeper_domain::id::CommandId;
    use sporekeeper_domain::sync::EntityType;

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn device() -> DeviceId {
        DeviceId::new("chamber-01")
    }

    fn logic(t0: Timestamp) -> ControlLogic {
        ControlLogic::new(
            ControllerSettings::new(device()),
            Phase::Fruiting,
            &BTreeMap::new(),
            t0,
        )
    }

    fn reading(metric: Metric, value: f64, at: Timestamp) -> Reading {
        Reading::new(device(), metric, value, at)
    }

    fn override_cmd(actuator: Actuator, state: bool, ttl_secs: u64, at: Timestamp) -> Command {
        Command::received(
            CommandId::new(),
            format!("op-{}", uuid_like()),
            CommandKind::SetOverride {
                actuator,
                state,
                ttl_secs,
            },
            at,
        )
        .unwrap()
    }

    fn uuid_like() -> String {
        CommandId::new().to_string()
    }

    fn target(logic: &ControlLogic, actuator: Actuator) -> bool {
        logic.targets()[&actuator]
    }

    // ── threshold control ───────────────────────────────────

    #[test]
    fn should_follow_co2_hysteresis_in_fruiting_phase() {
        let t0 = now();
        let mut l = logic(t0);

        let d = l.on_reading(&reading(Metric::Co2, 1050.0, t0), t0).unwrap();
        assert!(target(&l, Actuator::ExhaustFan));
        assert!(matches!(d.cause, DecisionCause::Threshold { bound, .. } if bound == 1000.0));
        assert_eq!(d.inputs.readings[&Metric::Co2].value, 1050.0);

        assert!(l.on_reading(&reading(Metric::Co2, 980.0, t0), t0).is_none());
        assert!(target(&l, Actuator::ExhaustFan));

        let d = l.on_reading(&reading(Metric::Co2, 900.0, t0), t0).unwrap();
        assert!(!target(&l, Actuator::ExhaustFan));
        assert!(d.changes[0].from);
        assert!(!d.changes[0].to);
    }

    #[test]
    fn should_not_emit_decision_when_target_unchanged() {
        let t0 = now();
        let mut l = logic(t0);
        assert!(l.on_reading(&reading(Metric::Co2, 500.0, t0), t0).is_none());
        assert!(l.on_reading(&reading(Metric::Humidity, 90.0, t0), t0).is_none());
    }

    #[test]
    fn should_keep_shared_actuator_on_while_any_rule_latched() {
        let t0 = now();
        let mut l = logic(t0);
        l.on_reading(&reading(Metric::Co2, 1100.0, t0), t0);
        l.on_reading(&reading(Metric::Humidity, 97.0, t0), t0);
        assert!(l.on_reading(&reading(Metric::Co2, 800.0, t0), t0).is_none());
        assert!(target(&l, Actuator::ExhaustFan));

        let d = l.on_reading(&reading(Metric::Humidity, 90.0, t0), t0).unwrap();
        assert!(!target(&l, Actuator::ExhaustFan));
        assert!(matches!(d.cause, DecisionCause::Threshold { rule, .. } if rule.metric == Metric::Humidity));
    }

    #[test]
    fn should_ignore_invalid_readings() {
        let t0 = now();
        let mut l = logic(t0);
        let bad = reading(Metric::Co2, 5000.0, t0)
            .with_quality(sporekeeper_domain::reading::QualityFlag::Invalid);
        assert!(l.on_reading(&bad, t0).is_none());
        assert!(!target(&l, Actuator::ExhaustFan));
    }

    #[test]
    fn should_switch_heater_on_below_minimum_temperature() {
        let t0 = now();
        let mut l = logic(t0);
        l.on_reading(&reading(Metric::Temperature, 15.0, t0), t0).unwrap();
        assert!(target(&l, Actuator::Heater));
        assert!(l.on_reading(&reading(Metric::Temperature, 16.3, t0), t0).is_none());
        l.on_reading(&reading(Metric::Temperature, 16.8, t0), t0).unwrap();
        assert!(!target(&l, Actuator::Heater));
    }

    // ── overrides ───────────────────────────────────────────

    #[test]
    fn should_suppress_automation_while_override_active() {
        let t0 = now();
        let mut l = logic(t0);
        let cmd = override_cmd(Actuator::Humidifier, true, 300, t0);
        let d = l
            .on_command(&cmd, ControlSource::RemoteOverride, t0)
            .unwrap()
            .unwrap();
        assert!(matches!(d.cause, DecisionCause::OverrideSet { .. }));
        assert!(target(&l, Actuator::Humidifier));

        // Humidity far above max would normally keep the humidifier off.
        assert!(l.on_reading(&reading(Metric::Humidity, 99.0, t0 + secs(60)), t0 + secs(60)).is_none());
        assert!(target(&l, Actuator::Humidifier));
        assert!(l.on_tick(t0 + secs(299)).is_empty());
        assert!(target(&l, Actuator::Humidifier));
    }

    #[test]
    fn should_resume_from_current_reading_when_override_expires() {
        let t0 = now();
        let mut l = logic(t0);
        let cmd = override_cmd(Actuator::Humidifier, true, 300, t0);
        l.on_command(&cmd, ControlSource::RemoteOverride, t0).unwrap();
        l.on_reading(&reading(Metric::Humidity, 99.0, t0 + secs(290)), t0 + secs(290));

        let decisions = l.on_tick(t0 + secs(300));

        assert_eq!(decisions.len(), 1);
        assert!(matches!(
            decisions[0].cause,
            DecisionCause::OverrideReleased {
                reason: ReleaseReason::Expired,
                ..
            }
        ));
        assert!(!target(&l, Actuator::Humidifier));
        assert!(l.overrides().is_empty());
    }

    #[test]
    fn should_hold_override_state_in_dead_band_after_release() {
        let t0 = now();
        let mut l = logic(t0);
        let cmd = override_cmd(Actuator::Humidifier, true, 60, t0);
        l.on_command(&cmd, ControlSource::Manual, t0).unwrap();
        // 86 is inside the humidity dead-band (85..87).
        l.on_reading(&reading(Metric::Humidity, 86.0, t0), t0);

        assert!(l.on_tick(t0 + secs(61)).is_empty());
        assert!(target(&l, Actuator::Humidifier));
    }

    #[test]
    fn should_clamp_override_ttl_to_configured_maximum() {
        let t0 = now();
        let mut l = logic(t0);
        let cmd = override_cmd(Actuator::Heater, true, 86_400, t0);
        l.on_command(&cmd, ControlSource::RemoteOverride, t0).unwrap();
        assert_eq!(l.overrides()[&Actuator::Heater].until, t0 + secs(3600));
    }

    #[test]
    fn should_release_override_explicitly() {
        let t0 = now();
        let mut l = logic(t0);
        let cmd = override_cmd(Actuator::Heater, true, 600, t0);
        l.on_command(&cmd, ControlSource::Manual, t0).unwrap();

        let release = Command::local(
            CommandKind::ReleaseOverride {
                actuator: Actuator::Heater,
            },
            t0,
        );
        let d = l
            .on_command(&release, ControlSource::Manual, t0 + secs(5))
            .unwrap()
            .unwrap();
        assert!(matches!(
            d.cause,
            DecisionCause::OverrideReleased {
                reason: ReleaseReason::Released,
                ..
            }
        ));
        assert!(!target(&l, Actuator::Heater));
    }

    // ── phase ───────────────────────────────────────────────

    #[test]
    fn should_reevaluate_against_new_bands_when_phase_changes() {
        let t0 = now();
        let mut l = ControlLogic::new(
            ControllerSettings::new(device()),
            Phase::Spawning,
            &BTreeMap::new(),
            t0,
        );
        assert!(l.on_reading(&reading(Metric::Co2, 1500.0, t0), t0).is_none());

        let cmd = Command::local(
            CommandKind::SetPhase {
                phase: Phase::Fruiting,
            },
            t0,
        );
        let d = l.on_command(&cmd, ControlSource::RemoteOverride, t0).unwrap().unwrap();

        assert!(matches!(
            d.cause,
            DecisionCause::PhaseChanged {
                from: Phase::Spawning,
                to: Phase::Fruiting
            }
        ));
        assert!(target(&l, Actuator::ExhaustFan));
        assert_eq!(l.phase(), Phase::Fruiting);
    }

    #[test]
    fn should_reject_connectivity_reset_as_control_command() {
        let t0 = now();
        let mut l = logic(t0);
        let cmd = Command::local(CommandKind::ResetConnectivity, t0);
        assert!(l.on_command(&cmd, ControlSource::RemoteOverride, t0).is_err());
    }

    // ── fail-safe ───────────────────────────────────────────

    #[test]
    fn should_hold_state_during_grace_then_force_safe_defaults() {
        let t0 = now();
        let mut l = logic(t0);
        l.on_reading(&reading(Metric::Temperature, 15.0, t0), t0).unwrap();
        l.on_reading(&reading(Metric::Co2, 500.0, t0), t0);
        l.on_reading(&reading(Metric::Humidity, 90.0, t0), t0);
        assert!(target(&l, Actuator::Heater));

        // Stale (120s) but within grace (60s): hold.
        assert!(l.on_tick(t0 + secs(150)).is_empty());
        assert!(target(&l, Actuator::Heater));

        let decisions = l.on_tick(t0 + secs(181));
        let temp = decisions
            .iter()
            .find(|d| matches!(d.cause, DecisionCause::FailSafe { metric: Metric::Temperature, .. }))
            .unwrap();
        assert!(temp.alert);
        assert!(!target(&l, Actuator::Heater));
        assert!(target(&l, Actuator::ExhaustFan));
    }

    #[test]
    fn should_leave_fail_safe_on_fresh_reading() {
        let t0 = now();
        let mut l = logic(t0);
        let decisions = l.on_tick(t0 + secs(200));
        assert_eq!(decisions.len(), 3);
        assert!(target(&l, Actuator::ExhaustFan));

        let at = t0 + secs(201);
        let d = l.on_reading(&reading(Metric::Co2, 500.0, at), at).unwrap();
        assert!(matches!(d.cause, DecisionCause::FailSafeCleared { metric: Metric::Co2 }));
        assert_eq!(l.fail_safe_metrics().len(), 2);
        // Fan still forced by the other stale metrics.
        assert!(target(&l, Actuator::ExhaustFan));
    }

    #[test]
    fn should_not_repeat_fail_safe_decision_while_still_stale() {
        let t0 = now();
        let mut l = logic(t0);
        assert_eq!(l.on_tick(t0 + secs(200)).len(), 3);
        assert!(l.on_tick(t0 + secs(260)).is_empty());
    }

    // ── protected mode ──────────────────────────────────────

    #[test]
    fn should_force_safe_defaults_in_protected_mode() {
        let t0 = now();
        let mut l = logic(t0);
        l.on_reading(&reading(Metric::Temperature, 10.0, t0), t0);
        assert!(target(&l, Actuator::Heater));

        let d = l.enter_protected("disk gone", t0).unwrap();
        assert!(d.alert);
        assert_eq!(l.mode(), ControlMode::Protected);
        assert!(!target(&l, Actuator::Heater));
        assert!(target(&l, Actuator::ExhaustFan));
        assert!(l.enter_protected("again", t0).is_none());

        let cmd = override_cmd(Actuator::Heater, true, 60, t0);
        assert!(l.on_command(&cmd, ControlSource::Manual, t0).is_err());
    }

    // ── loop integration ────────────────────────────────────

    type TestController =
        AutomationController<InMemoryJournal, FakeDriver, InMemoryActuatorRepo, InMemorySettings>;

    async fn controller(
        journal: InMemoryJournal,
        driver: FakeDriver,
        store: InMemorySettings,
    ) -> (TestController, StateHolder) {
        let state = StateHolder::new(DeviceStatus::new(device(), Phase::Fruiting));
        let settings = ActuatorSettings {
            min_on: Duration::ZERO,
            min_off: Duration::ZERO,
            ..ActuatorSettings::default()
        };
        let actuators = ActuatorService::restore(
            driver,
            InMemoryActuatorRepo::default(),
            journal.clone(),
            state.clone(),
            settings,
            now(),
        )
        .await
        .unwrap();
        let ctl = AutomationController::new(
            ControllerSettings::new(device()),
            Phase::Fruiting,
            actuators,
            journal,
            store,
            ControlQueue::new(16),
            state.clone(),
        );
        (ctl, state)
    }

    #[tokio::test]
    async fn should_journal_decision_and_drive_actuator() {
        let journal = InMemoryJournal::default();
        let driver = FakeDriver::default();
        let (mut ctl, state) = controller(journal.clone(), driver.clone(), InMemorySettings::default()).await;
        let t = now();

        ctl.handle(ControlInput::Reading(reading(Metric::Co2, 1050.0, t)), t)
            .await;

        assert_eq!(journal.entries(EntityType::Decision).len(), 1);
        assert_eq!(journal.entries(EntityType::ActuatorTransition).len(), 1);
        assert_eq!(driver.state(Actuator::ExhaustFan), Some(true));
        assert!(state.snapshot().actuators[&Actuator::ExhaustFan].on);
        assert_eq!(state.snapshot().latest[&Metric::Co2].value, 1050.0);
    }

    #[tokio::test]
    async fn should_reply_and_persist_phase_for_set_phase_command() {
        let store = InMemorySettings::default();
        let (mut ctl, state) =
            controller(InMemoryJournal::default(), FakeDriver::default(), store.clone()).await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let cmd = Command::local(
            CommandKind::SetPhase {
                phase: Phase::Spawning,
            },
            now(),
        );

        ctl.handle(
            ControlInput::Command(QueuedCommand {
                command: cmd,
                source: ControlSource::RemoteOverride,
                reply: Some(tx),
            }),
            now(),
        )
        .await;

        assert_eq!(rx.await.unwrap(), CommandOutcome::applied());
        assert_eq!(store.raw(crate::ports::store::PHASE_KEY).as_deref(), Some("spawning"));
        assert_eq!(state.snapshot().phase, Phase::Spawning);
    }

    async fn exhaust_storage_retries(ctl: &mut TestController, journal: &InMemoryJournal, t: Timestamp) {
        journal.fail_writes(true);
        ctl.handle(ControlInput::Reading(reading(Metric::Co2, 1100.0, t)), t).await;
        ctl.tick(t + secs(10)).await;
        ctl.tick(t + secs(30)).await;
    }

    #[tokio::test]
    async fn should_enter_protected_mode_after_storage_retries_run_out() {
        let journal = InMemoryJournal::default();
        let (mut ctl, state) =
            controller(journal.clone(), FakeDriver::default(), InMemorySettings::default()).await;
        journal.fail_writes(true);
        let t = now();

        ctl.handle(ControlInput::Reading(reading(Metric::Co2, 1100.0, t)), t).await;
        assert_eq!(state.snapshot().mode, ControlMode::Normal);
        // Not yet due for another attempt.
        ctl.tick(t + secs(1)).await;
        assert_eq!(state.snapshot().mode, ControlMode::Normal);
        ctl.tick(t + secs(10)).await;
        assert_eq!(state.snapshot().mode, ControlMode::Normal);
        ctl.tick(t + secs(30)).await;

        assert_eq!(state.snapshot().mode, ControlMode::Protected);
        assert!(state.snapshot().actuators[&Actuator::ExhaustFan].on);
    }

    #[tokio::test]
    async fn should_stay_normal_when_storage_recovers_after_one_failed_sample() {
        use crate::services::acquisition::{AcquisitionSettings, SensorAcquisition};
        use crate::testing::FakeSensors;

        let journal = InMemoryJournal::default();
        let (mut ctl, state) =
            controller(journal.clone(), FakeDriver::default(), InMemorySettings::default()).await;
        let sensors = FakeSensors::default();
        sensors.set(Metric::Temperature, Some(18.0));
        sensors.set(Metric::Humidity, Some(90.0));
        sensors.set(Metric::Co2, Some(800.0));
        let acquisition = SensorAcquisition::new(
            sensors,
            journal.clone(),
            ctl.queue.clone(),
            state.clone(),
            AcquisitionSettings::new(device()),
        );
        let t = now();

        journal.fail_writes(true);
        acquisition.sample_all(t).await;
        assert_eq!(state.snapshot().faults.consecutive_storage_failures, 1);

        journal.fail_writes(false);
        while let Some(input) = ctl.queue.try_pop() {
            ctl.handle(input, t).await;
        }

        assert_eq!(state.snapshot().mode, ControlMode::Normal);
        assert_eq!(state.snapshot().faults.consecutive_storage_failures, 0);
        acquisition.sample_all(t + secs(12)).await;
        assert_eq!(journal.entries(EntityType::Reading).len(), 3);
    }

    #[tokio::test]
    async fn should_leave_protected_mode_once_storage_accepts_writes() {
        let journal = InMemoryJournal::default();
        let (mut ctl, state) =
            controller(journal.clone(), FakeDriver::default(), InMemorySettings::default()).await;
        let t = now();
        exhaust_storage_retries(&mut ctl, &journal, t).await;
        assert_eq!(state.snapshot().mode, ControlMode::Protected);

        journal.fail_writes(false);
        ctl.tick(t + secs(60)).await;

        assert_eq!(state.snapshot().mode, ControlMode::Normal);
        assert_eq!(state.snapshot().faults.consecutive_storage_failures, 0);
        let decisions = journal.entries(EntityType::Decision);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].payload["cause"]["kind"], "protected_mode_cleared");
        // Overrides are accepted again.
        let cmd = override_cmd(Actuator::Heater, true, 60, t + secs(61));
        assert!(ctl.logic.on_command(&cmd, ControlSource::Manual, t + secs(61)).is_ok());
    }

    #[tokio::test]
    async fn should_not_journal_anything_while_protected() {
        use crate::services::acquisition::{AcquisitionSettings, SensorAcquisition};
        use crate::testing::FakeSensors;

        let journal = InMemoryJournal::default();
        let driver = FakeDriver::default();
        let (mut ctl, state) =
            controller(journal.clone(), driver.clone(), InMemorySettings::default()).await;
        let t = now();
        ctl.handle(ControlInput::Reading(reading(Metric::Humidity, 70.0, t)), t).await;
        assert_eq!(driver.state(Actuator::Humidifier), Some(true));
        let decisions = journal.entries(EntityType::Decision).len();
        let transitions = journal.entries(EntityType::ActuatorTransition).len();

        exhaust_storage_retries(&mut ctl, &journal, t).await;
        assert_eq!(state.snapshot().mode, ControlMode::Protected);
        assert_eq!(driver.state(Actuator::Humidifier), Some(false));

        // Writes would succeed now, but the next recovery attempt is not due.
        journal.fail_writes(false);
        let sensors = FakeSensors::default();
        sensors.set(Metric::Co2, Some(800.0));
        let acquisition = SensorAcquisition::new(
            sensors,
            journal.clone(),
            ctl.queue.clone(),
            state.clone(),
            AcquisitionSettings::new(device()),
        );
        acquisition.sample_all(t + secs(31)).await;
        while let Some(input) = ctl.queue.try_pop() {
            ctl.handle(input, t + secs(31)).await;
        }

        assert_eq!(state.snapshot().mode, ControlMode::Protected);
        assert!(journal.entries(EntityType::Reading).is_empty());
        assert_eq!(journal.entries(EntityType::Decision).len(), decisions);
        assert_eq!(journal.entries(EntityType::ActuatorTransition).len(), transitions);
    }

    #[tokio::test]
    async fn should_stop_when_shutdown_triggered() {
        let (ctl, _state) =
            controller(InMemoryJournal::default(), FakeDriver::default(), InMemorySettings::default()).await;
        let queue = ctl.queue.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        queue.push(ControlInput::Command(QueuedCommand {
            command: override_cmd(Actuator::Heater, true, 60, now()),
            source: ControlSource::Manual,
            reply: Some(tx),
        }));
        let (trigger, shutdown) = crate::shutdown::channel();
        trigger.trigger();

        tokio::spawn(ctl.run(shutdown)).await.unwrap();

        assert_eq!(rx.await.unwrap(), CommandOutcome::applied());
        assert!(queue.is_closed());
        assert!(queue.is_empty());
    }
}
