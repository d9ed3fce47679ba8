//! Sync manager: drains the journal to the remote ingestion endpoint.
//!
//! Each pass takes one bounded, oldest-first batch of `pending` entries per
//! entity type, marks it `in_flight` and sends it. Per-item verdicts decide
//! the outcome:
//!
//! - accepted → `acked`
//! - rejected → attempt counted, back to `pending` or on to `dead_letter`
//! - no verdict (transport error, missing from the response) → back to
//!   `pending` without counting an attempt
//!
//! Every entity carries its client-generated id and the remote side upserts
//! by it, so re-sending after a mid-batch failure never duplicates anything.
//! The loop never gives up while entries are pending: failures only stretch
//! the interval, first with backoff and then with the degraded cadence.

use std::collections::HashMap;
use std::time::Duration;

use sporekeeper_domain::connectivity::ConnectivityState;
use sporekeeper_domain::error::{ProtocolFault, SporeKeeperError};
use sporekeeper_domain::sync::{EntityType, JournalEntry, SyncState};
use sporekeeper_domain::time::{Timestamp, now, span};

use crate::backoff::Backoff;
use crate::ports::{IngestItem, IngestionClient, Journal};
use crate::shutdown::Shutdown;
use crate::state::StateHolder;

const PRUNE_EVERY: Duration = Duration::from_secs(3600);

/// Sync loop configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub batch_size: usize,
    /// Pause between passes while healthy.
    pub interval: Duration,
    pub backoff: Backoff,
    /// Consecutive failed passes before switching to the degraded cadence.
    pub degraded_after: u32,
    pub degraded_interval: Duration,
    /// Rejections before an entry is dead-lettered.
    pub max_attempts: u32,
    /// Requeue dead letters automatically after this cooldown.
    pub auto_requeue_after: Option<Duration>,
    /// Prune acked entries older than this.
    pub retention: Option<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval: Duration::from_secs(10),
            backoff: Backoff::new(Duration::from_secs(2), Duration::from_secs(120)),
            degraded_after: 5,
            degraded_interval: Duration::from_secs(300),
            max_attempts: 5,
            auto_requeue_after: None,
            retention: None,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub sent: usize,
    pub acked: usize,
    pub rejected: usize,
    pub dead_lettered: usize,
    pub released: usize,
    /// A full batch went through; more entries are probably waiting.
    pub more: bool,
}

/// Background reconciliation of the journal with the remote store.
pub struct SyncManager<J, C> {
    journal: J,
    client: C,
    state: StateHolder,
    settings: SyncSettings,
    failures: u32,
    last_prune: Option<Timestamp>,
}

impl<J, C> SyncManager<J, C>
where
    J: Journal,
    C: IngestionClient,
{
    pub fn new(journal: J, client: C, state: StateHolder, settings: SyncSettings) -> Self {
        Self {
            journal,
            client,
            state,
            settings,
            failures: 0,
            last_prune: None,
        }
    }

    /// Run passes until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        tracing::info!(
            batch_size = self.settings.batch_size,
            interval_ms = self.settings.interval.as_millis(),
            "sync manager started"
        );
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = self.pass(now()).await;
        }
        tracing::info!("sync manager stopped");
    }

    /// One scheduled pass, including housekeeping. Returns the delay before
    /// the next pass.
    pub async fn pass(&mut self, now: Timestamp) -> Duration {
        let connectivity = self.state.connectivity();
        if !connectivity.is_online() {
            tracing::trace!(%connectivity, "offline, sync pass skipped");
            return self.settings.interval;
        }

        self.housekeeping(now).await;

        let delay = match self.run_once().await {
            Ok(report) => {
                if report.sent > 0 {
                    tracing::debug!(
                        sent = report.sent,
                        acked = report.acked,
                        rejected = report.rejected,
                        released = report.released,
                        "sync pass complete"
                    );
                }
                self.failures = 0;
                if report.more {
                    Duration::ZERO
                } else {
                    self.healthy_interval(connectivity)
                }
            }
            Err(err) => {
                self.failures += 1;
                let backoff = self.settings.backoff.delay(self.failures - 1);
                let delay = if self.is_degraded(connectivity) {
                    backoff.max(self.settings.degraded_interval)
                } else {
                    backoff
                };
                tracing::warn!(
                    %err,
                    consecutive_failures = self.failures,
                    retry_in_ms = delay.as_millis(),
                    "sync pass failed"
                );
                delay
            }
        };

        self.publish(connectivity, now).await;
        delay
    }

    fn is_degraded(&self, connectivity: ConnectivityState) -> bool {
        self.failures >= self.settings.degraded_after
            || connectivity == ConnectivityState::Degraded
    }

    fn healthy_interval(&self, connectivity: ConnectivityState) -> Duration {
        if connectivity == ConnectivityState::Degraded {
            self.settings.degraded_interval
        } else {
            self.settings.interval
        }
    }

    /// Send one batch per entity type. A failing type does not hold back
    /// the others.
    ///
    /// # Errors
    ///
    /// Returns the first storage or network error once every type has had
    /// its turn; entries of a failed batch are back in `pending` with their
    /// attempt count unchanged.
    pub async fn run_once(&self) -> Result<SyncReport, SporeKeeperError> {
        let mut report = SyncReport::default();
        let mut first_error = None;
        for entity_type in EntityType::ALL {
            if let Err(err) = self.sync_type(entity_type, &mut report).await {
                tracing::debug!(%err, %entity_type, "sync of entity type failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    async fn sync_type(
        &self,
        entity_type: EntityType,
        report: &mut SyncReport,
    ) -> Result<(), SporeKeeperError> {
        let batch = self
            .journal
            .pending_batch(entity_type, self.settings.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        let sequences: Vec<i64> = batch.iter().map(|e| e.record.sequence).collect();
        self.journal
            .mark_in_flight(entity_type, sequences.clone())
            .await?;

        let items: Vec<IngestItem> = batch
            .iter()
            .map(|e| IngestItem {
                id: e.record.entity_id.clone(),
                payload: e.payload.clone(),
            })
            .collect();
        report.sent += items.len();

        let outcomes = match self.client.send_batch(entity_type, items).await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                self.journal
                    .release(entity_type, sequences, err.to_string())
                    .await?;
                return Err(err);
            }
        };

        let mut verdicts: HashMap<String, (bool, Option<String>)> = outcomes
            .into_iter()
            .map(|o| (o.id, (o.accepted, o.reason)))
            .collect();

        let mut acked = Vec::new();
        let mut unjudged = Vec::new();
        for entry in &batch {
            match verdicts.remove(&entry.record.entity_id) {
                Some((true, _)) => acked.push(entry.record.sequence),
                Some((false, reason)) => {
                    self.reject(entity_type, entry, reason, report).await?;
                }
                None => unjudged.push(entry.record.sequence),
            }
        }
        if !verdicts.is_empty() {
            let fault = ProtocolFault::Mismatch(format!(
                "{} verdicts for ids not in the {entity_type} batch",
                verdicts.len()
            ));
            tracing::warn!(%fault, "ignoring unexpected ingestion verdicts");
        }

        report.acked += acked.len();
        if acked.len() == batch.len() && batch.len() == self.settings.batch_size {
            report.more = true;
        }
        if !acked.is_empty() {
            self.journal.mark_acked(entity_type, acked).await?;
        }
        if !unjudged.is_empty() {
            report.released += unjudged.len();
            self.journal
                .release(entity_type, unjudged, "no verdict in response".to_string())
                .await?;
        }
        Ok(())
    }

    async fn reject(
        &self,
        entity_type: EntityType,
        entry: &JournalEntry,
        reason: Option<String>,
        report: &mut SyncReport,
    ) -> Result<(), SporeKeeperError> {
        let reason = reason.unwrap_or_else(|| "rejected".to_string());
        report.rejected += 1;
        let state = self
            .journal
            .reject(
                entity_type,
                entry.record.sequence,
                reason.clone(),
                self.settings.max_attempts,
            )
            .await?;
        if state == SyncState::DeadLetter {
            report.dead_lettered += 1;
            tracing::warn!(
                %entity_type,
                id = %entry.record.entity_id,
                attempts = entry.record.attempts + 1,
                %reason,
                "sync entry dead-lettered"
            );
        } else {
            tracing::debug!(%entity_type, id = %entry.record.entity_id, %reason, "sync entry rejected");
        }
        Ok(())
    }

    async fn housekeeping(&mut self, now: Timestamp) {
        if let Some(cooldown) = self.settings.auto_requeue_after {
            match self
                .journal
                .requeue_dead_letters(None, Some(now - span(cooldown)))
                .await
            {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "dead letters requeued after cooldown"),
                Err(err) => tracing::warn!(%err, "failed to requeue dead letters"),
            }
        }

        let Some(retention) = self.settings.retention else {
            return;
        };
        if self
            .last_prune
            .is_some_and(|at| now - at < span(PRUNE_EVERY))
        {
            return;
        }
        self.last_prune = Some(now);
        match self.journal.prune_acked_before(now - span(retention)).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "pruned acked journal entries"),
            Err(err) => tracing::warn!(%err, "failed to prune journal"),
        }
    }

    async fn publish(&self, connectivity: ConnectivityState, now: Timestamp) {
        let dead_lettered = match self.journal.counts().await {
            Ok(counts) => Some(counts.values().map(|c| c.dead_letter).sum()),
            Err(err) => {
                tracing::debug!(%err, "failed to read sync counts");
                None
            }
        };
        let failures = self.failures;
        let degraded = self.is_degraded(connectivity);
        self.state.update(|s| {
            s.sync.consecutive_failures = failures;
            s.sync.degraded = degraded;
            if failures == 0 {
                s.sync.last_success = Some(now);
            }
            if let Some(dead) = dead_lettered {
                s.sync.dead_lettered = dead;
            }
        });
    }
}
