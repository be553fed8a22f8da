//! In-memory key-value store for development and testing
//!
//! Nothing is persisted across process restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::infrastructure::ports::{KeyValueStore, RepoError};

/// Store name -> (key -> value)
#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    stores: Arc<RwLock<HashMap<String, BTreeMap<String, String>>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get_item(&self, store: &str, key: &str) -> Result<Option<String>, RepoError> {
        let stores = self.stores.read().await;
        Ok(stores.get(store).and_then(|items| items.get(key)).cloned())
    }

    async fn set_item(&self, store: &str, key: &str, value: &str) -> Result<bool, RepoError> {
        let mut stores = self.stores.write().await;
        stores
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn remove_item(&self, store: &str, key: &str) -> Result<bool, RepoError> {
        let mut stores = self.stores.write().await;
        Ok(stores
            .get_mut(store)
            .map(|items| items.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn get_all(&self, store: &str) -> Result<Vec<(String, String)>, RepoError> {
        let stores = self.stores.read().await;
        Ok(stores
            .get(store)
            .map(|items| {
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
