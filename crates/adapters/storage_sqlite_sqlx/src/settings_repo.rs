//! `SQLite` implementation of [`SettingsStore`].

use sqlx::SqlitePool;

use sporekeeper_app::ports::SettingsStore;
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::time::now;

use crate::error::StorageError;
use crate::time::encode;

const SELECT: &str = "SELECT value FROM settings WHERE key = ?";

const UPSERT: &str = r"
    INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
    ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
";

const DELETE: &str = "DELETE FROM settings WHERE key = ?";

/// `SQLite`-backed key-value settings area.
#[derive(Debug, Clone)]
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SqliteSettingsStore {
    /// Create a new store using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl SettingsStore for SqliteSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SporeKeeperError> {
        let value: Option<String> = sqlx::query_scalar(SELECT)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), SporeKeeperError> {
        sqlx::query(UPSERT)
            .bind(key)
            .bind(value)
            .bind(encode(now()))
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SporeKeeperError> {
        sqlx::query(DELETE)
            .bind(key)
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
    use sporekeeper_domain::credentials::NetworkCredentials;
    use sporekeeper_domain::phase::Phase;

    async fn setup() -> SqliteSettingsStore {
        SqliteSettingsStore::new(memory().await.pool().clone())
    }

    #[tokio::test]
    async fn should_overwrite_existing_key() {
        let store = setup().await;
        store.put("a", "1".into()).await.unwrap();
        store.put("a", "2".into()).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn should_forget_deleted_key() {
        let store = setup().await;
        store.put("a", "1".into()).await.unwrap();
        store.delete("a").await.unwrap();
        store.delete("never-there").await.unwrap();

        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn should_persist_credentials_and_phase() {
        let store = setup().await;
        let credentials = NetworkCredentials {
            ssid: "grow-room".into(),
            passphrase: "spores-everywhere".into(),
            controller: None,
        };

        store.save_credentials(&credentials).await.unwrap();
        store.save_phase(Phase::Spawning).await.unwrap();

        assert_eq!(store.credentials().await.unwrap(), Some(credentials));
        assert_eq!(store.phase().await.unwrap(), Some(Phase::Spawning));

        store.clear_credentials().await.unwrap();
        assert!(store.credentials().await.unwrap().is_none());
    }
}
