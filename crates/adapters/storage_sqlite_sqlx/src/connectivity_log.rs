//! `SQLite` implementation of [`ConnectivityLog`].

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use sporekeeper_app::ports::ConnectivityLog;
use sporekeeper_domain::connectivity::ConnectivityTransition;
use sporekeeper_domain::error::SporeKeeperError;

use crate::error::StorageError;
use crate::time::{decode, decode_name, encode};

/// Rows kept after each insert. Older transitions are dropped.
const RETAINED: i64 = 1_000;

struct Wrapper(ConnectivityTransition);

impl<'r> FromRow<'r, SqliteRow> for Wrapper {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let from: String = row.try_get("from_state")?;
        let to: String = row.try_get("to_state")?;
        let at: String = row.try_get("at")?;
        let reason: String = row.try_get("reason")?;

        Ok(Self(ConnectivityTransition {
            from: decode_name(&from)?,
            to: decode_name(&to)?,
            at: decode(&at)?,
            reason,
        }))
    }
}

const INSERT: &str =
    "INSERT INTO connectivity_transitions (from_state, to_state, at, reason) VALUES (?, ?, ?, ?)";

const TRIM: &str = r"
    DELETE FROM connectivity_transitions
    WHERE id <= (SELECT MAX(id) FROM connectivity_transitions) - ?
";

const SELECT_RECENT: &str = r"
    SELECT * FROM (
        SELECT * FROM connectivity_transitions ORDER BY id DESC LIMIT ?
    ) ORDER BY id
";

/// `SQLite`-backed connectivity transition history.
#[derive(Debug, Clone)]
pub struct SqliteConnectivityLog {
    pool: SqlitePool,
}

impl SqliteConnectivityLog {
    /// Create a new log using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl ConnectivityLog for SqliteConnectivityLog {
    async fn record(&self, transition: ConnectivityTransition) -> Result<(), SporeKeeperError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        sqlx::query(INSERT)
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(encode(transition.at))
            .bind(&transition.reason)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        sqlx::query(TRIM)
            .bind(RETAINED)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        tx.commit().await.map_err(StorageError::from)?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ConnectivityTransition>, SporeKeeperError> {
        let rows: Vec<Wrapper> = sqlx::query_as(SELECT_RECENT)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(rows.into_iter().map(|w| w.0).collect())
    }
}
