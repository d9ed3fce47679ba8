//! `SQLite` implementation of [`Journal`].
//!
//! Every entity type has its own sequence counter in `journal_sequences`,
//! bumped in the same transaction as the insert. Sync state edges are guarded
//! in the `WHERE` clause, so an update that does not match the expected state
//! touches nothing.

use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use sporekeeper_app::ports::Journal;
use sporekeeper_domain::error::{NotFoundError, SporeKeeperError};
use sporekeeper_domain::sync::{EntityType, JournalEntry, SyncCounts, SyncRecord, SyncState};
use sporekeeper_domain::time::{Timestamp, now};

use crate::error::StorageError;
use crate::time::{decode, decode_name, encode};

struct Wrapper(JournalEntry);

impl<'r> FromRow<'r, SqliteRow> for Wrapper {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let entity_type: String = row.try_get("entity_type")?;
        let sequence: i64 = row.try_get("local_seq")?;
        let entity_id: String = row.try_get("entity_id")?;
        let payload: String = row.try_get("payload")?;
        let state: String = row.try_get("state")?;
        let attempts: i64 = row.try_get("attempts")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let recorded_at: String = row.try_get("recorded_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        let payload: serde_json::Value =
            serde_json::from_str(&payload).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;

        Ok(Self(JournalEntry {
            record: SyncRecord {
                entity_type: decode_name(&entity_type)?,
                sequence,
                entity_id,
                state: decode_name(&state)?,
                attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                last_error,
                recorded_at: decode(&recorded_at)?,
                updated_at: decode(&updated_at)?,
            },
            payload,
        }))
    }
}

const NEXT_SEQUENCE: &str = r"
    INSERT INTO journal_sequences (entity_type, last_seq) VALUES (?, 1)
    ON CONFLICT (entity_type) DO UPDATE SET last_seq = last_seq + 1
    RETURNING last_seq
";

const INSERT: &str = r"
    INSERT INTO journal (entity_type, local_seq, entity_id, payload, state, attempts, recorded_at, updated_at)
    VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
";

const SELECT_PENDING: &str = r"
    SELECT * FROM journal
    WHERE entity_type = ? AND state = 'pending'
    ORDER BY local_seq
    LIMIT ?
";

const MOVE_STATE: &str = r"
    UPDATE journal SET state = ?, updated_at = ?
    WHERE entity_type = ? AND local_seq = ? AND state = ?
";

const RELEASE: &str = r"
    UPDATE journal SET state = 'pending', last_error = ?, updated_at = ?
    WHERE entity_type = ? AND local_seq = ? AND state = 'in_flight'
";

const REJECT: &str = r"
    UPDATE journal
    SET attempts = attempts + 1,
        last_error = ?1,
        updated_at = ?2,
        state = CASE WHEN attempts + 1 >= ?3 THEN 'dead_letter' ELSE 'pending' END
    WHERE entity_type = ?4 AND local_seq = ?5 AND state = 'in_flight'
    RETURNING state
";

const REQUEUE: &str = r"
    UPDATE journal SET state = 'pending', attempts = 0, updated_at = ?1
    WHERE state = 'dead_letter'
      AND (?2 IS NULL OR entity_type = ?2)
      AND (?3 IS NULL OR updated_at <= ?3)
";

const SELECT_DEAD_LETTERS: &str = r"
    SELECT * FROM journal WHERE state = 'dead_letter'
    ORDER BY updated_at, entity_type, local_seq
    LIMIT ?
";

const COUNT_BY_STATE: &str =
    "SELECT entity_type, state, COUNT(*) AS total FROM journal GROUP BY entity_type, state";

const SELECT_RANGE: &str = r"
    SELECT * FROM journal
    WHERE entity_type = ? AND recorded_at >= ? AND recorded_at < ?
    ORDER BY recorded_at, local_seq
    LIMIT ?
";

const RECOVER: &str =
    "UPDATE journal SET state = 'pending', updated_at = ? WHERE state = 'in_flight'";

const TOUCH_HEALTH: &str = r"
    INSERT INTO storage_health (id, checked_at) VALUES (1, ?)
    ON CONFLICT (id) DO UPDATE SET checked_at = excluded.checked_at
";

const PRUNE: &str = "DELETE FROM journal WHERE state = 'acked' AND recorded_at < ?";

/// `SQLite`-backed journal.
#[derive(Debug, Clone)]
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    /// Create a new journal using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn move_state(
        &self,
        entity_type: EntityType,
        sequences: &[i64],
        from: SyncState,
        to: SyncState,
    ) -> Result<(), StorageError> {
        let at = encode(now());
        let mut tx = self.pool.begin().await?;
        let mut moved = 0;
        for &sequence in sequences {
            moved += sqlx::query(MOVE_STATE)
                .bind(to.as_str())
                .bind(&at)
                .bind(entity_type.as_str())
                .bind(sequence)
                .bind(from.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        if moved < sequences.len() as u64 {
            tracing::warn!(
                %entity_type,
                %from,
                %to,
                expected = sequences.len(),
                moved,
                "some journal entries were not in the expected state"
            );
        }
        Ok(())
    }
}

fn limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl Journal for SqliteJournal {
    async fn append(
        &self,
        entity_type: EntityType,
        entity_id: String,
        recorded_at: Timestamp,
        payload: serde_json::Value,
    ) -> Result<SyncRecord, SporeKeeperError> {
        let payload_json = serde_json::to_string(&payload).map_err(StorageError::from)?;
        let updated_at = now();

        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        let sequence: i64 = sqlx::query_scalar(NEXT_SEQUENCE)
            .bind(entity_type.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        sqlx::query(INSERT)
            .bind(entity_type.as_str())
            .bind(sequence)
            .bind(&entity_id)
            .bind(&payload_json)
            .bind(encode(recorded_at))
            .bind(encode(updated_at))
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        tx.commit().await.map_err(StorageError::from)?;

        Ok(SyncRecord {
            entity_type,
            sequence,
            entity_id,
            state: SyncState::Pending,
            attempts: 0,
            last_error: None,
            recorded_at,
            updated_at,
        })
    }

    async fn pending_batch(
        &self,
        entity_type: EntityType,
        limit_to: usize,
    ) -> Result<Vec<JournalEntry>, SporeKeeperError> {
        let rows: Vec<Wrapper> = sqlx::query_as(SELECT_PENDING)
            .bind(entity_type.as_str())
            .bind(limit(limit_to))
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(rows.into_iter().map(|w| w.0).collect())
    }

    async fn mark_in_flight(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
    ) -> Result<(), SporeKeeperError> {
        self.move_state(entity_type, &sequences, SyncState::Pending, SyncState::InFlight)
            .await?;
        Ok(())
    }

    async fn mark_acked(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
    ) -> Result<(), SporeKeeperError> {
        self.move_state(entity_type, &sequences, SyncState::InFlight, SyncState::Acked)
            .await?;
        Ok(())
    }

    async fn release(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
        error: String,
    ) -> Result<(), SporeKeeperError> {
        let at = encode(now());
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        for sequence in sequences {
            sqlx::query(RELEASE)
                .bind(&error)
                .bind(&at)
                .bind(entity_type.as_str())
                .bind(sequence)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::from)?;
        }
        tx.commit().await.map_err(StorageError::from)?;
        Ok(())
    }

    async fn reject(
        &self,
        entity_type: EntityType,
        sequence: i64,
        error: String,
        max_attempts: u32,
    ) -> Result<SyncState, SporeKeeperError> {
        let state: Option<String> = sqlx::query_scalar(REJECT)
            .bind(&error)
            .bind(encode(now()))
            .bind(i64::from(max_attempts))
            .bind(entity_type.as_str())
            .bind(sequence)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;

        match state {
            Some(raw) => Ok(decode_name(&raw).map_err(StorageError::from)?),
            None => Err(NotFoundError {
                entity: "in-flight journal entry",
                id: format!("{entity_type}/{sequence}"),
            }
            .into()),
        }
    }

    async fn requeue_dead_letters(
        &self,
        entity_type: Option<EntityType>,
        idle_since: Option<Timestamp>,
    ) -> Result<u64, SporeKeeperError> {
        let result = sqlx::query(REQUEUE)
            .bind(encode(now()))
            .bind(entity_type.map(EntityType::as_str))
            .bind(idle_since.map(encode))
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(result.rows_affected())
    }

    async fn dead_letters(&self, limit_to: usize) -> Result<Vec<JournalEntry>, SporeKeeperError> {
        let rows: Vec<Wrapper> = sqlx::query_as(SELECT_DEAD_LETTERS)
            .bind(limit(limit_to))
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(rows.into_iter().map(|w| w.0).collect())
    }

    async fn counts(&self) -> Result<BTreeMap<EntityType, SyncCounts>, SporeKeeperError> {
        let rows = sqlx::query(COUNT_BY_STATE)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        let mut counts: BTreeMap<EntityType, SyncCounts> = EntityType::ALL
            .into_iter()
            .map(|t| (t, SyncCounts::default()))
            .collect();
        for row in rows {
            let entity_type: String = row.try_get("entity_type").map_err(StorageError::from)?;
            let state: String = row.try_get("state").map_err(StorageError::from)?;
            let total: i64 = row.try_get("total").map_err(StorageError::from)?;
            let entity_type: EntityType = decode_name(&entity_type).map_err(StorageError::from)?;
            let state: SyncState = decode_name(&state).map_err(StorageError::from)?;

            let entry = counts.entry(entity_type).or_default();
            let total = u64::try_from(total).unwrap_or_default();
            match state {
                SyncState::Pending => entry.pending = total,
                SyncState::InFlight => entry.in_flight = total,
                SyncState::Acked => entry.acked = total,
                SyncState::DeadLetter => entry.dead_letter = total,
            }
        }
        Ok(counts)
    }

    async fn find_in_range(
        &self,
        entity_type: EntityType,
        from: Timestamp,
        to: Timestamp,
        limit_to: usize,
    ) -> Result<Vec<JournalEntry>, SporeKeeperError> {
        let rows: Vec<Wrapper> = sqlx::query_as(SELECT_RANGE)
            .bind(entity_type.as_str())
            .bind(encode(from))
            .bind(encode(to))
            .bind(limit(limit_to))
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(rows.into_iter().map(|w| w.0).collect())
    }

    async fn recover_in_flight(&self) -> Result<u64, SporeKeeperError> {
        let result = sqlx::query(RECOVER)
            .bind(encode(now()))
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(result.rows_affected())
    }

    async fn prune_acked_before(&self, cutoff: Timestamp) -> Result<u64, SporeKeeperError> {
        let result = sqlx::query(PRUNE)
            .bind(encode(cutoff))
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(result.rows_affected())
    }

    async fn check_writable(&self) -> Result<(), SporeKeeperError> {
        sqlx::query(TOUCH_HEALTH)
            .bind(encode(now()))
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory;
    use chrono::Duration;
    use sporekeeper_domain::id::DeviceId;
    use sporekeeper_domain::reading::{Metric, Reading};

    async fn setup() -> SqliteJournal {
        SqliteJournal::new(memory().await.pool().clone())
    }

    fn reading(value: f64) -> Reading {
        Reading::new(DeviceId::new("chamber-01"), Metric::Co2, value, now())
    }

    async fn append_n(journal: &SqliteJournal, n: usize) -> Vec<i64> {
        let mut sequences = Vec::with_capacity(n);
        for i in 0..n {
            let record = journal.append_reading(&reading(800.0 + i as f64)).await.unwrap();
            sequences.push(record.sequence);
        }
        sequences
    }

    #[tokio::test]
    async fn should_assign_increasing_sequences_per_entity_type() {
        let journal = setup().await;

        let readings = append_n(&journal, 3).await;
        let decision = journal
            .append(EntityType::Decision, "d-1".into(), now(), serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(readings, vec![1, 2, 3]);
        assert_eq!(decision.sequence, 1);
    }

    #[tokio::test]
    async fn should_keep_sequences_increasing_after_prune() {
        let journal = setup().await;
        let first = append_n(&journal, 2).await;
        journal.mark_in_flight(EntityType::Reading, first.clone()).await.unwrap();
        journal.mark_acked(EntityType::Reading, first).await.unwrap();
        journal
            .prune_acked_before(now() + Duration::minutes(1))
            .await
            .unwrap();

        let next = journal.append_reading(&reading(900.0)).await.unwrap();

        assert_eq!(next.sequence, 3);
    }

    #[tokio::test]
    async fn should_round_trip_payload_in_pending_batch() {
        let journal = setup().await;
        let r = reading(812.5);
        journal.append_reading(&r).await.unwrap();

        let batch = journal.pending_batch(EntityType::Reading, 10).await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record.entity_id, r.id.to_string());
        let decoded: Reading = serde_json::from_value(batch[0].payload.clone()).unwrap();
        assert_eq!(decoded, r);
    }

    #[tokio::test]
    async fn should_return_pending_batch_oldest_first_and_bounded() {
        let journal = setup().await;
        append_n(&journal, 5).await;

        let batch = journal.pending_batch(EntityType::Reading, 3).await.unwrap();

        let seqs: Vec<i64> = batch.iter().map(|e| e.record.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn should_exclude_in_flight_entries_from_pending_batch() {
        let journal = setup().await;
        let seqs = append_n(&journal, 3).await;
        journal.mark_in_flight(EntityType::Reading, seqs[..2].to_vec()).await.unwrap();

        let batch = journal.pending_batch(EntityType::Reading, 10).await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record.sequence, 3);
    }

    #[tokio::test]
    async fn should_not_ack_entries_that_were_never_in_flight() {
        let journal = setup().await;
        let seqs = append_n(&journal, 1).await;

        journal.mark_acked(EntityType::Reading, seqs).await.unwrap();

        let counts = journal.counts().await.unwrap();
        assert_eq!(counts[&EntityType::Reading].pending, 1);
        assert_eq!(counts[&EntityType::Reading].acked, 0);
    }

    #[tokio::test]
    async fn should_release_without_counting_an_attempt() {
        let journal = setup().await;
        let seqs = append_n(&journal, 1).await;
        journal.mark_in_flight(EntityType::Reading, seqs.clone()).await.unwrap();

        journal
            .release(EntityType::Reading, seqs, "connection reset".into())
            .await
            .unwrap();

        let batch = journal.pending_batch(EntityType::Reading, 10).await.unwrap();
        assert_eq!(batch[0].record.attempts, 0);
        assert_eq!(batch[0].record.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn should_dead_letter_after_max_attempts() {
        let journal = setup().await;
        let seqs = append_n(&journal, 1).await;

        let mut states = Vec::new();
        for _ in 0..3 {
            journal.mark_in_flight(EntityType::Reading, seqs.clone()).await.unwrap();
            let state = journal
                .reject(EntityType::Reading, seqs[0], "schema mismatch".into(), 3)
                .await
                .unwrap();
            states.push(state);
        }

        assert_eq!(
            states,
            vec![SyncState::Pending, SyncState::Pending, SyncState::DeadLetter]
        );
        let dead = journal.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].record.attempts, 3);
        assert_eq!(dead[0].record.last_error.as_deref(), Some("schema mismatch"));
    }

    #[tokio::test]
    async fn should_refuse_to_reject_entry_that_is_not_in_flight() {
        let journal = setup().await;
        let seqs = append_n(&journal, 1).await;

        let err = journal
            .reject(EntityType::Reading, seqs[0], "nope".into(), 3)
            .await
            .unwrap_err();

        assert!(matches!(err, SporeKeeperError::NotFound(_)));
    }

    #[tokio::test]
    async fn should_requeue_dead_letters_with_fresh_budget() {
        let journal = setup().await;
        let seqs = append_n(&journal, 1).await;
        journal.mark_in_flight(EntityType::Reading, seqs.clone()).await.unwrap();
        journal
            .reject(EntityType::Reading, seqs[0], "bad".into(), 1)
            .await
            .unwrap();

        let other_type = journal
            .requeue_dead_letters(Some(EntityType::Decision), None)
            .await
            .unwrap();
        let moved = journal
            .requeue_dead_letters(Some(EntityType::Reading), None)
            .await
            .unwrap();

        assert_eq!(other_type, 0);
        assert_eq!(moved, 1);
        let batch = journal.pending_batch(EntityType::Reading, 10).await.unwrap();
        assert_eq!(batch[0].record.attempts, 0);
    }

    #[tokio::test]
    async fn should_only_requeue_dead_letters_idle_since_cutoff() {
        let journal = setup().await;
        let seqs = append_n(&journal, 1).await;
        journal.mark_in_flight(EntityType::Reading, seqs.clone()).await.unwrap();
        journal
            .reject(EntityType::Reading, seqs[0], "bad".into(), 1)
            .await
            .unwrap();

        let too_recent = journal
            .requeue_dead_letters(None, Some(now() - Duration::hours(1)))
            .await
            .unwrap();
        let old_enough = journal
            .requeue_dead_letters(None, Some(now() + Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(too_recent, 0);
        assert_eq!(old_enough, 1);
    }

    #[tokio::test]
    async fn should_recover_in_flight_entries_after_crash() {
        let journal = setup().await;
        let seqs = append_n(&journal, 4).await;
        journal.mark_in_flight(EntityType::Reading, seqs[..3].to_vec()).await.unwrap();

        let recovered = journal.recover_in_flight().await.unwrap();

        assert_eq!(recovered, 3);
        let counts = journal.counts().await.unwrap();
        assert_eq!(counts[&EntityType::Reading].pending, 4);
        assert_eq!(counts[&EntityType::Reading].in_flight, 0);
    }

    #[tokio::test]
    async fn should_report_zero_counts_for_empty_types() {
        let journal = setup().await;
        append_n(&journal, 2).await;

        let counts = journal.counts().await.unwrap();

        assert_eq!(counts.len(), 3);
        assert_eq!(counts[&EntityType::Reading].backlog(), 2);
        assert_eq!(counts[&EntityType::Decision], SyncCounts::default());
    }

    #[tokio::test]
    async fn should_find_entries_in_half_open_range() {
        let journal = setup().await;
        let t0 = now();
        for (i, offset) in [0, 30, 60].into_iter().enumerate() {
            journal
                .append(
                    EntityType::Decision,
                    format!("d-{i}"),
                    t0 + Duration::seconds(offset),
                    serde_json::json!({ "i": i }),
                )
                .await
                .unwrap();
        }

        let found = journal
            .find_in_range(EntityType::Decision, t0, t0 + Duration::seconds(60), 10)
            .await
            .unwrap();

        let ids: Vec<&str> = found.iter().map(|e| e.record.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["d-0", "d-1"]);
    }

    #[tokio::test]
    async fn should_prune_only_acked_entries() {
        let journal = setup().await;
        let seqs = append_n(&journal, 3).await;
        journal.mark_in_flight(EntityType::Reading, seqs[..2].to_vec()).await.unwrap();
        journal.mark_acked(EntityType::Reading, vec![seqs[0]]).await.unwrap();

        let pruned = journal
            .prune_acked_before(now() + Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(pruned, 1);
        let counts = journal.counts().await.unwrap();
        assert_eq!(counts[&EntityType::Reading].in_flight, 1);
        assert_eq!(counts[&EntityType::Reading].pending, 1);
    }

    #[tokio::test]
    async fn should_accept_repeated_writability_checks() {
        let journal = setup().await;
        journal.check_writable().await.unwrap();
        journal.check_writable().await.unwrap();

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storage_health")
            .fetch_one(&journal.pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn should_store_nan_reading_with_raw_value() {
        let journal = setup().await;
        let r = reading(f64::NAN).with_quality(sporekeeper_domain::reading::QualityFlag::Invalid);
        journal.append_reading(&r).await.unwrap();

        let batch = journal.pending_batch(EntityType::Reading, 10).await.unwrap();

        assert_eq!(batch[0].payload["value"], "NaN");
        let decoded: Reading = serde_json::from_value(batch[0].payload.clone()).unwrap();
        assert!(decoded.value.is_nan());
    }
}
