//! Diagnostics service: the operator's read and intervention surface.
//!
//! Reads come from the [`StateHolder`] snapshot and the durable stores.
//! Interventions never mutate control state directly: overrides travel
//! through the control queue like any other command, and a connectivity
//! reset goes through the [`ConnectivityHandle`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use sporekeeper_domain::actuator::{Actuator, ActuatorState, ControlSource};
use sporekeeper_domain::command::{Command, CommandKind};
use sporekeeper_domain::connectivity::{ConnectivityState, ConnectivityTransition, HISTORY_LIMIT};
use sporekeeper_domain::decision::Decision;
use sporekeeper_domain::error::{ProtocolFault, SporeKeeperError};
use sporekeeper_domain::sync::{EntityType, JournalEntry, SyncCounts};
use sporekeeper_domain::time::{Timestamp, now};

use crate::ports::{CommandLog, ConnectivityLog, Journal};
use crate::queue::{CommandOutcome, ControlQueue};
use crate::services::connectivity_manager::ConnectivityHandle;
use crate::state::{DeviceStatus, OverrideStatus, StateHolder};

/// Everything `GET /api/status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub device: DeviceStatus,
    pub backlog: u64,
    pub sync_counts: BTreeMap<EntityType, SyncCounts>,
}

/// One actuator with its active override, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ActuatorReport {
    #[serde(flatten)]
    pub state: ActuatorState,
    #[serde(rename = "override")]
    pub active_override: Option<OverrideStatus>,
}

/// Connectivity state plus recent history, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    pub state: ConnectivityState,
    pub since: Timestamp,
    pub history: Vec<ConnectivityTransition>,
}

/// Operator-facing queries and interventions.
pub struct DiagnosticsService<J, L, C> {
    journal: J,
    connectivity_log: L,
    command_log: C,
    state: StateHolder,
    queue: ControlQueue,
    connectivity: ConnectivityHandle,
    reply_timeout: Duration,
}

impl<J, L, C> DiagnosticsService<J, L, C>
where
    J: Journal,
    L: ConnectivityLog,
    C: CommandLog,
{
    pub fn new(
        journal: J,
        connectivity_log: L,
        command_log: C,
        state: StateHolder,
        queue: ControlQueue,
        connectivity: ConnectivityHandle,
    ) -> Self {
        Self {
            journal,
            connectivity_log,
            command_log,
            state,
            queue,
            connectivity,
            reply_timeout: Duration::from_secs(5),
        }
    }

    /// Device snapshot plus sync backlog.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the journal counts cannot be read.
    pub async fn status(&self) -> Result<StatusReport, SporeKeeperError> {
        let sync_counts = self.journal.counts().await?;
        let backlog = sync_counts.values().map(SyncCounts::backlog).sum();
        Ok(StatusReport {
            device: self.state.snapshot(),
            backlog,
            sync_counts,
        })
    }

    #[must_use]
    pub fn actuators(&self) -> Vec<ActuatorReport> {
        let status = self.state.snapshot();
        status
            .actuators
            .into_values()
            .map(|state| ActuatorReport {
                active_override: status.overrides.get(&state.actuator).cloned(),
                state,
            })
            .collect()
    }

    /// Decisions recorded in `[from, to)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or a protocol error if a stored payload no
    /// longer decodes.
    pub async fn decisions(
        &self,
        from: Timestamp,
        to: Timestamp,
        limit: usize,
    ) -> Result<Vec<Decision>, SporeKeeperError> {
        self.journal
            .find_in_range(EntityType::Decision, from, to, limit)
            .await?
            .into_iter()
            .map(|entry| {
                serde_json::from_value(entry.payload)
                    .map_err(|err| ProtocolFault::Malformed(err.to_string()).into())
            })
            .collect()
    }

    /// # Errors
    ///
    /// Returns a storage error if the journal cannot be read.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<JournalEntry>, SporeKeeperError> {
        self.journal.dead_letters(limit).await
    }

    /// Move dead letters back to `pending`. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the journal cannot be updated.
    pub async fn requeue_dead_letters(
        &self,
        entity_type: Option<EntityType>,
    ) -> Result<u64, SporeKeeperError> {
        let count = self.journal.requeue_dead_letters(entity_type, None).await?;
        tracing::info!(count, entity_type = ?entity_type, "dead letters requeued by operator");
        Ok(count)
    }

    /// # Errors
    ///
    /// Returns a storage error if the connectivity log cannot be read.
    pub async fn connectivity(&self) -> Result<ConnectivityReport, SporeKeeperError> {
        let history = self.connectivity_log.recent(HISTORY_LIMIT).await?;
        let (state, since) = self
            .state
            .read(|s| (s.connectivity, s.connectivity_since));
        Ok(ConnectivityReport {
            state,
            since,
            history,
        })
    }

    /// Most recent commands, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the command log cannot be read.
    pub async fn commands(&self, limit: usize) -> Result<Vec<Command>, SporeKeeperError> {
        self.command_log.recent(limit).await
    }

    /// Force an actuator for `ttl_secs` (clamped by the controller).
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero ttl.
    pub async fn set_override(
        &self,
        actuator: Actuator,
        on: bool,
        ttl_secs: u64,
    ) -> Result<CommandOutcome, SporeKeeperError> {
        let kind = CommandKind::SetOverride {
            actuator,
            state: on,
            ttl_secs,
        };
        kind.validate()?;
        Ok(self.submit(kind).await)
    }

    pub async fn release_override(&self, actuator: Actuator) -> CommandOutcome {
        self.submit(CommandKind::ReleaseOverride { actuator }).await
    }

    /// # Errors
    ///
    /// Fails if credentials could not be cleared.
    pub async fn reset_connectivity(&self) -> Result<(), SporeKeeperError> {
        tracing::warn!("connectivity reset requested by operator");
        self.connectivity.reset().await
    }

    async fn submit(&self, kind: CommandKind) -> CommandOutcome {
        let command = Command::local(kind, now());
        self.queue
            .submit(command, ControlSource::Manual, self.reply_timeout)
            .await
    }
}
