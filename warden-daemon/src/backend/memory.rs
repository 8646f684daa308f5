use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{Backend, BackendError, Item};

/// Process-local backend for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: Mutex<BTreeMap<String, Item>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Item>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, BackendError> {
        let mut items = self.items();
        let version = items.get(key).map_or(1, |item| item.version + 1);
        items.insert(
            key.to_string(),
            Item {
                key: key.to_string(),
                value,
                version,
            },
        );
        Ok(version)
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, BackendError> {
        Ok(self.items().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.items().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Item>, BackendError> {
        Ok(self
            .items()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, item)| item.clone())
            .collect())
    }
}
