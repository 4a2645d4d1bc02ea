use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::protocol::SyncRecord;

pub const DEFAULT_BASE_URL: &str = "ws://127.0.0.1:9480";

/// Relay address and room membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub room_id: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            room_id: String::new(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// Persisted session state: `{server: {baseUrl, roomId}, syncData: {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_data: Option<SyncRecord>,
}

impl SessionConfig {
    pub fn room_id(&self) -> Option<&str> {
        let room = self.server.room_id.trim();
        (!room.is_empty()).then_some(room)
    }

    pub fn merge(&mut self, patch: ConfigPatch) {
        if let Some(base_url) = patch.base_url {
            self.server.base_url = base_url;
        }
        if let Some(room_id) = patch.room_id {
            self.server.room_id = room_id;
        }
        if let Some(sync_data) = patch.sync_data {
            self.sync_data = Some(sync_data);
        }
    }

    /// Fills in a generated room id when none has been chosen yet. Returns
    /// true when the config changed.
    pub fn ensure_room_id(&mut self) -> bool {
        if self.room_id().is_some() {
            return false;
        }
        self.server.room_id = Uuid::new_v4().to_string();
        true
    }
}

/// Partial update applied by [`ConfigStore::set`]; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub base_url: Option<String>,
    pub room_id: Option<String>,
    pub sync_data: Option<SyncRecord>,
}

impl ConfigPatch {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id.into()),
            ..Self::default()
        }
    }

    pub fn sync_data(record: SyncRecord) -> Self {
        Self {
            sync_data: Some(record),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// Storage for the session config. Implementations must give read-after-write
/// consistency within one process.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self) -> SyncResult<SessionConfig>;

    /// Merges `patch`, persists, and returns the merged config.
    async fn set(&self, patch: ConfigPatch) -> SyncResult<SessionConfig>;
}

/// In-memory adapter for tests and one-shot commands.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    inner: Mutex<SessionConfig>,
}

impl InMemoryConfigStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Mutex::new(config),
        }
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get(&self) -> SyncResult<SessionConfig> {
        Ok(self.inner.lock().await.clone())
    }

    async fn set(&self, patch: ConfigPatch) -> SyncResult<SessionConfig> {
        let mut guard = self.inner.lock().await;
        guard.merge(patch);
        Ok(guard.clone())
    }
}
