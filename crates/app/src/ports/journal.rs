//! Journal port: the durable append-only local store.
//!
//! Each [`EntityType`] is its own log keyed by a strictly increasing local
//! sequence id. An append only returns once the entry is durable, so anything
//! the caller has seen acknowledged survives a crash or power loss.

use std::collections::BTreeMap;
use std::future::Future;

use serde::Serialize;
use sporekeeper_domain::actuator::ActuatorTransition;
use sporekeeper_domain::decision::Decision;
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::reading::Reading;
use sporekeeper_domain::sync::{EntityType, JournalEntry, SyncCounts, SyncRecord, SyncState};
use sporekeeper_domain::time::Timestamp;

/// Durable journal of readings, decisions and actuator transitions.
pub trait Journal: Send + Sync {
    /// Durably append an entity. The new record starts `pending`.
    fn append(
        &self,
        entity_type: EntityType,
        entity_id: String,
        recorded_at: Timestamp,
        payload: serde_json::Value,
    ) -> impl Future<Output = Result<SyncRecord, SporeKeeperError>> + Send;

    /// Oldest-first batch of `pending` entries of one type.
    fn pending_batch(
        &self,
        entity_type: EntityType,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<JournalEntry>, SporeKeeperError>> + Send;

    /// `pending -> in_flight` for the given sequences.
    fn mark_in_flight(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// `in_flight -> acked` for the given sequences.
    fn mark_acked(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// `in_flight -> pending` without counting an attempt.
    ///
    /// Used when the batch never reached the remote side, so nothing was
    /// judged and the entries keep their attempt budget.
    fn release(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
        error: String,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Count a rejected attempt: `in_flight -> pending`, or `-> dead_letter`
    /// once `attempts` reaches `max_attempts`. Returns the resulting state.
    fn reject(
        &self,
        entity_type: EntityType,
        sequence: i64,
        error: String,
        max_attempts: u32,
    ) -> impl Future<Output = Result<SyncState, SporeKeeperError>> + Send;

    /// `dead_letter -> pending` with a fresh attempt budget.
    ///
    /// `entity_type` narrows to one log; `idle_since` only requeues entries
    /// that have been dead-lettered since before that instant.
    fn requeue_dead_letters(
        &self,
        entity_type: Option<EntityType>,
        idle_since: Option<Timestamp>,
    ) -> impl Future<Output = Result<u64, SporeKeeperError>> + Send;

    /// Dead-lettered entries, oldest first.
    fn dead_letters(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<JournalEntry>, SporeKeeperError>> + Send;

    /// Per-type totals by state.
    fn counts(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<EntityType, SyncCounts>, SporeKeeperError>> + Send;

    /// Entries of one type recorded in `[from, to)`, oldest first.
    fn find_in_range(
        &self,
        entity_type: EntityType,
        from: Timestamp,
        to: Timestamp,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<JournalEntry>, SporeKeeperError>> + Send;

    /// Crash recovery: every `in_flight` entry goes back to `pending`.
    fn recover_in_flight(&self) -> impl Future<Output = Result<u64, SporeKeeperError>> + Send;

    /// Delete `acked` entries recorded before `cutoff`. Other states are kept.
    fn prune_acked_before(
        &self,
        cutoff: Timestamp,
    ) -> impl Future<Output = Result<u64, SporeKeeperError>> + Send;

    /// Make one small durable write to confirm storage accepts writes again.
    fn check_writable(&self) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Journal a reading.
    fn append_reading(
        &self,
        reading: &Reading,
    ) -> impl Future<Output = Result<SyncRecord, SporeKeeperError>> + Send {
        let encoded = encode(reading);
        let id = reading.id.to_string();
        let at = reading.timestamp;
        async move { self.append(EntityType::Reading, id, at, encoded?).await }
    }

    /// Journal a decision.
    fn append_decision(
        &self,
        decision: &Decision,
    ) -> impl Future<Output = Result<SyncRecord, SporeKeeperError>> + Send {
        let encoded = encode(decision);
        let id = decision.id.to_string();
        let at = decision.timestamp;
        async move { self.append(EntityType::Decision, id, at, encoded?).await }
    }

    /// Journal an actuator transition.
    fn append_transition(
        &self,
        transition: &ActuatorTransition,
    ) -> impl Future<Output = Result<SyncRecord, SporeKeeperError>> + Send {
        let encoded = encode(transition);
        let id = transition.id.to_string();
        let at = transition.at;
        async move {
            self.append(EntityType::ActuatorTransition, id, at, encoded?)
                .await
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, SporeKeeperError> {
    serde_json::to_value(value).map_err(SporeKeeperError::storage)
}
