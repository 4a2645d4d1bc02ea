use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tandem_core::{ConfigPatch, ConfigStore, Message, SessionConfig, SyncError, SyncRecord, SyncResult};
use tracing::info;
use uuid::Uuid;

use crate::channel::RoomChannel;

/// User-facing operations: broadcast a sync, re-broadcast the last one, and
/// manage room membership.
pub struct CommandSurface {
    channel: RoomChannel,
    store: Arc<dyn ConfigStore>,
    sender: String,
    last_seq: AtomicU64,
}

impl CommandSurface {
    pub fn new(channel: RoomChannel, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            channel,
            store,
            sender: Uuid::new_v4().to_string(),
            last_seq: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> &RoomChannel {
        &self.channel
    }

    /// Sender id stamped on every sync from this process. Receivers order
    /// sequence numbers per sender, so clocks on different machines are
    /// never compared.
    pub fn sender_id(&self) -> &str {
        &self.sender
    }

    /// Connects to the configured room, generating a room id first if none
    /// has been chosen.
    pub async fn join(&self) -> SyncResult<SessionConfig> {
        let mut config = self.store.get().await?;
        if config.ensure_room_id() {
            config = self
                .store
                .set(ConfigPatch::room(config.server.room_id.clone()))
                .await?;
            info!(target: "tandem::commands", room_id = %config.server.room_id, "generated room id");
        }
        self.channel.reconnect().await?;
        Ok(config)
    }

    /// Stamps `record` with this sender and a fresh sequence number, remembers it as the last
    /// sync and sends it to the room. The record is persisted even when the
    /// send fails, so `resync` can retry it.
    pub async fn sync(&self, record: SyncRecord) -> SyncResult<SyncRecord> {
        record.validate()?;
        let record = record
            .with_sender(self.sender.clone())
            .with_seq(self.next_seq());
        self.store
            .set(ConfigPatch::sync_data(record.clone()))
            .await?;
        self.channel.send(&Message::Sync(record.clone()))?;
        info!(
            target: "tandem::commands",
            repo = %record.repo,
            branch = %record.branch,
            seq = record.seq,
            "broadcast sync"
        );
        Ok(record)
    }

    pub async fn resync(&self) -> SyncResult<SyncRecord> {
        let config = self.store.get().await?;
        let record = config
            .sync_data
            .ok_or_else(|| SyncError::Config("no previous sync to resend".into()))?;
        self.sync(record).await
    }

    pub async fn reconnect(&self) -> SyncResult<u64> {
        self.channel.reconnect().await
    }

    /// Persists a new room and/or relay and re-establishes the channel.
    pub async fn set_room(
        &self,
        room_id: Option<String>,
        base_url: Option<String>,
    ) -> SyncResult<SessionConfig> {
        let patch = ConfigPatch {
            room_id: room_id.map(|room| room.trim().to_string()),
            base_url: base_url.map(|url| url.trim().to_string()),
            ..ConfigPatch::default()
        };
        if patch.room_id.as_deref() == Some("") {
            return Err(SyncError::Config("room id must not be blank".into()));
        }
        let config = self.store.set(patch).await?;
        self.channel.reconnect().await?;
        Ok(config)
    }

    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    /// Unix milliseconds, forced strictly increasing within this process.
    fn next_seq(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut last = self.last_seq.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_seq
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}
