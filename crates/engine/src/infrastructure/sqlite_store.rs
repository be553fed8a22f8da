//! SQLite-backed key-value storage.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::infrastructure::ports::{ClockPort, KeyValueStore, RepoError};

/// SQLite implementation of the key-value persistence port.
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
    clock: Arc<dyn ClockPort>,
}

impl SqliteKeyValueStore {
    pub async fn new(db_path: &str, clock: Arc<dyn ClockPort>) -> Result<Self, RepoError> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await
            .map_err(|e| RepoError::database("kv_connect", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                store TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (store, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| RepoError::database("kv_migrate", e))?;

        tracing::debug!(db_path, "SQLite key-value store ready");
        Ok(Self { pool, clock })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get_item(&self, store: &str, key: &str) -> Result<Option<String>, RepoError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE store = ? AND key = ?")
            .bind(store)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepoError::database("kv_get", e))?;

        Ok(row.map(|row| row.get("value")))
    }

    async fn set_item(&self, store: &str, key: &str, value: &str) -> Result<bool, RepoError> {
        let now = self.clock.now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO kv_store (store, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(store, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(store)
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::database("kv_set", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_item(&self, store: &str, key: &str) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE store = ? AND key = ?")
            .bind(store)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::database("kv_remove", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_all(&self, store: &str) -> Result<Vec<(String, String)>, RepoError> {
        let rows = sqlx::query("SELECT key, value FROM kv_store WHERE store = ? ORDER BY key")
            .bind(store)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepoError::database("kv_get_all", e))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }
}
