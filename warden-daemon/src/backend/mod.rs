//! Key-value storage behind the registry and the certificate authority.
//!
//! Keys are `/`-separated paths (`nodes/<id>`, `ca/state`); values are opaque
//! bytes, JSON in practice. Every write bumps the key's version.

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;

/// A stored value and its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    /// Starts at 1 and increases on every write to the key.
    pub version: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        BackendError::Storage(err.to_string())
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Store `value` under `key`, returning the new version.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, BackendError>;

    async fn get(&self, key: &str) -> Result<Option<Item>, BackendError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// All items whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<Item>, BackendError>;
}

/// Store `value` as JSON under `key`.
pub async fn put_json<T: serde::Serialize + ?Sized>(
    backend: &dyn Backend,
    key: &str,
    value: &T,
) -> Result<u64, BackendError> {
    let bytes = serde_json::to_vec(value).map_err(|e| BackendError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    backend.put(key, bytes).await
}

/// Load and decode the JSON value under `key`.
pub async fn get_json<T: serde::de::DeserializeOwned>(
    backend: &dyn Backend,
    key: &str,
) -> Result<Option<T>, BackendError> {
    let Some(item) = backend.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&item.value)
        .map(Some)
        .map_err(|e| BackendError::Corrupt {
            key: item.key,
            reason: e.to_string(),
        })
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every backend must share.

    use super::*;

    pub async fn versions_increase(backend: &dyn Backend) {
        assert_eq!(backend.put("nodes/a", b"1".to_vec()).await.unwrap(), 1);
        assert_eq!(backend.put("nodes/a", b"2".to_vec()).await.unwrap(), 2);

        let item = backend.get("nodes/a").await.unwrap().unwrap();
        assert_eq!(item.value, b"2");
        assert_eq!(item.version, 2);
    }

    pub async fn list_by_prefix(backend: &dyn Backend) {
        backend.put("nodes/b", b"b".to_vec()).await.unwrap();
        backend.put("nodes/a", b"a".to_vec()).await.unwrap();
        backend.put("ca/state", b"{}".to_vec()).await.unwrap();

        let keys: Vec<String> = backend
            .list("nodes/")
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.key)
            .collect();
        assert_eq!(keys, ["nodes/a", "nodes/b"]);
    }

    pub async fn delete_removes(backend: &dyn Backend) {
        backend.put("nodes/a", b"a".to_vec()).await.unwrap();
        assert!(backend.delete("nodes/a").await.unwrap());
        assert!(!backend.delete("nodes/a").await.unwrap());
        assert!(backend.get("nodes/a").await.unwrap().is_none());
    }
}
