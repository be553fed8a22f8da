//! Persistence port.

use async_trait::async_trait;

use super::RepoError;

/// Async key-value contract for persisting committed snapshots between turns
///
/// Values are opaque strings grouped into named stores. `set_item` and
/// `remove_item` report whether the backing store accepted the write.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, store: &str, key: &str) -> Result<Option<String>, RepoError>;

    async fn set_item(&self, store: &str, key: &str, value: &str) -> Result<bool, RepoError>;

    async fn remove_item(&self, store: &str, key: &str) -> Result<bool, RepoError>;

    /// Every `(key, value)` record in the store, ordered by key.
    async fn get_all(&self, store: &str) -> Result<Vec<(String, String)>, RepoError>;
}
