//! Session snapshot persistence over the key-value port.

use std::sync::Arc;

use taverndb_domain::SessionSnapshot;

use crate::infrastructure::ports::{KeyValueStore, RepoError};

/// Store name holding serialized `SessionSnapshot` documents.
pub const SESSIONS_STORE: &str = "sessions";

/// Loads and saves `{ state, __tableMeta }` documents keyed by session id.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn KeyValueStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>, RepoError> {
        let Some(raw) = self.store.get_item(SESSIONS_STORE, session_id).await? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&raw).map_err(RepoError::serialization)?;
        Ok(Some(snapshot))
    }

    /// A fresh snapshot when the session has never been saved.
    pub async fn load_or_default(&self, session_id: &str) -> Result<SessionSnapshot, RepoError> {
        Ok(self.load(session_id).await?.unwrap_or_default())
    }

    pub async fn save(&self, session_id: &str, snapshot: &SessionSnapshot) -> Result<(), RepoError> {
        let raw = serde_json::to_string(snapshot).map_err(RepoError::serialization)?;
        let accepted = self.store.set_item(SESSIONS_STORE, session_id, &raw).await?;
        if !accepted {
            return Err(RepoError::database(
                "session_save",
                format!("store rejected write for session {}", session_id),
            ));
        }
        tracing::debug!(session_id, bytes = raw.len(), "Session snapshot saved");
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool, RepoError> {
        self.store.remove_item(SESSIONS_STORE, session_id).await
    }

    pub async fn list_ids(&self) -> Result<Vec<String>, RepoError> {
        Ok(self
            .store
            .get_all(SESSIONS_STORE)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }
}
