//! `SQLite` implementation of [`ActuatorStateRepository`].

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use sporekeeper_app::ports::ActuatorStateRepository;
use sporekeeper_domain::actuator::ActuatorState;
use sporekeeper_domain::error::SporeKeeperError;

use crate::error::StorageError;
use crate::time::{decode, decode_name, encode};

struct Wrapper(ActuatorState);

impl<'r> FromRow<'r, SqliteRow> for Wrapper {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let actuator: String = row.try_get("actuator")?;
        let on: bool = row.try_get("is_on")?;
        let last_changed_at: String = row.try_get("last_changed_at")?;
        let source: String = row.try_get("source")?;

        Ok(Self(ActuatorState {
            actuator: decode_name(&actuator)?,
            on,
            last_changed_at: decode(&last_changed_at)?,
            source: decode_name(&source)?,
        }))
    }
}

const SELECT_ALL: &str = "SELECT * FROM actuator_states ORDER BY actuator";

const UPSERT: &str = r"
    INSERT INTO actuator_states (actuator, is_on, last_changed_at, source)
    VALUES (?, ?, ?, ?)
    ON CONFLICT (actuator) DO UPDATE
    SET is_on = excluded.is_on,
        last_changed_at = excluded.last_changed_at,
        source = excluded.source
";

/// `SQLite`-backed actuator state repository.
#[derive(Debug, Clone)]
pub struct SqliteActuatorStateRepository {
    pool: SqlitePool,
}

impl SqliteActuatorStateRepository {
    /// Create a new repository using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl ActuatorStateRepository for SqliteActuatorStateRepository {
    async fn load_all(&self) -> Result<Vec<ActuatorState>, SporeKeeperError> {
        let rows: Vec<Wrapper> = sqlx::query_as(SELECT_ALL)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(rows.into_iter().map(|w| w.0).collect())
    }

    async fn save(&self, state: ActuatorState) -> Result<(), SporeKeeperError> {
        sqlx::query(UPSERT)
            .bind(state.actuator.as_str())
            .bind(state.on)
            .bind(encode(state.last_changed_at))
            .bind(state.source.as_str())
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(())
    }
}
