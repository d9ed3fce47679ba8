//! `SQLite` implementation of [`CommandLog`].
//!
//! The unique index on `idempotency_key` is what makes duplicate detection
//! survive restarts.

use std::str::FromStr;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use sporekeeper_app::ports::CommandLog;
use sporekeeper_domain::command::{Command, CommandKind, DeliveryState};
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::id::CommandId;

use crate::error::StorageError;
use crate::time::{decode, encode};

struct Wrapper(Command);

impl Wrapper {
    fn maybe(value: Option<Self>) -> Option<Command> {
        value.map(|w| w.0)
    }
}

impl<'r> FromRow<'r, SqliteRow> for Wrapper {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let idempotency_key: String = row.try_get("idempotency_key")?;
        let kind: String = row.try_get("kind")?;
        let received_at: String = row.try_get("received_at")?;
        let delivery_state: String = row.try_get("delivery_state")?;

        let id = CommandId::from_str(&id).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
        let kind: CommandKind =
            serde_json::from_str(&kind).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
        let delivery_state = DeliveryState::from_str(&delivery_state)
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;

        Ok(Self(Command {
            id,
            idempotency_key,
            kind,
            received_at: decode(&received_at)?,
            delivery_state,
        }))
    }
}

const INSERT: &str = r"
    INSERT INTO commands (id, idempotency_key, kind, received_at, delivery_state)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT (idempotency_key) DO NOTHING
";

const SELECT_BY_KEY: &str = "SELECT * FROM commands WHERE idempotency_key = ?";
const SELECT_RECENT: &str = "SELECT * FROM commands ORDER BY received_at DESC LIMIT ?";
const UPDATE_STATE: &str = "UPDATE commands SET delivery_state = ? WHERE id = ?";

/// `SQLite`-backed command log.
#[derive(Debug, Clone)]
pub struct SqliteCommandLog {
    pool: SqlitePool,
}

impl SqliteCommandLog {
    /// Create a new log using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl CommandLog for SqliteCommandLog {
    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Command>, SporeKeeperError> {
        let row: Option<Wrapper> = sqlx::query_as(SELECT_BY_KEY)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(Wrapper::maybe(row))
    }

    async fn insert(&self, command: Command) -> Result<bool, SporeKeeperError> {
        let kind_json = serde_json::to_string(&command.kind).map_err(StorageError::from)?;

        let result = sqlx::query(INSERT)
            .bind(command.id.to_string())
            .bind(&command.idempotency_key)
            .bind(&kind_json)
            .bind(encode(command.received_at))
            .bind(command.delivery_state.as_str())
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_state(&self, id: CommandId, state: DeliveryState) -> Result<(), SporeKeeperError> {
        sqlx::query(UPDATE_STATE)
            .bind(state.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Command>, SporeKeeperError> {
        let rows: Vec<Wrapper> = sqlx::query_as(SELECT_RECENT)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(rows.into_iter().map(|w| w.0).collect())
    }
}
