//! SQLite backend via sqlx.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{Backend, BackendError, Item};

#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open or create a database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        Self::connect(options).await
    }

    /// A private in-memory database.
    pub async fn in_memory() -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, BackendError> {
        // One connection: a single writer, and `:memory:` is per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Item, BackendError> {
    let version: i64 = row.try_get("version")?;
    Ok(Item {
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        version: u64::try_from(version).unwrap_or_default(),
    })
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, BackendError> {
        let row = sqlx::query(
            r#"
            INSERT INTO items (key, value, version) VALUES (?1, ?2, 1)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = items.version + 1
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;
        let version: i64 = row.try_get("version")?;
        Ok(u64::try_from(version).unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, BackendError> {
        let row = sqlx::query("SELECT key, value, version FROM items WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let result = sqlx::query("DELETE FROM items WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Item>, BackendError> {
        let rows = sqlx::query(
            "SELECT key, value, version FROM items WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }
}
