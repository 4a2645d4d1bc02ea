use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::extract::ws::{close_code, CloseFrame, Message};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use slab::Slab;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_CHANNEL_DEPTH: usize = 64;

/// Tunables for room membership. The idle timeout must stay above the client
/// heartbeat interval or healthy members get pruned.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub per_connection_buffer: usize,
    pub idle_timeout: Duration,
    pub recycle_interval: Duration,
    /// Deliver fanned-out frames back to their sender as well.
    pub echo_to_sender: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
            idle_timeout: Duration::from_secs(60),
            recycle_interval: Duration::from_secs(15),
            echo_to_sender: true,
        }
    }
}

#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RoomRegistryInner>,
}

struct RoomRegistryInner {
    rooms: DashMap<String, Arc<RoomState>>,
    config: RoomConfig,
    total_rooms: parking_lot::RwLock<usize>,
}

pub struct Registration {
    pub receiver: mpsc::Receiver<Message>,
    pub active_connections: usize,
    pub total_rooms: usize,
}

pub struct Removal {
    pub active_connections: usize,
    pub total_rooms: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub delivered: usize,
    pub bytes: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub connections: usize,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            inner: Arc::new(RoomRegistryInner {
                rooms: DashMap::new(),
                config,
                total_rooms: parking_lot::RwLock::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.inner.config
    }

    pub async fn register(&self, room_id: &str, connection_id: Uuid) -> Registration {
        let (tx, rx) = mpsc::channel(self.inner.config.per_connection_buffer);

        let mut new_room = false;
        let state = match self.inner.rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let state = Arc::new(RoomState::new(room_id.to_string()));
                entry.insert(Arc::clone(&state));
                new_room = true;
                state
            }
        };

        if new_room {
            *self.inner.total_rooms.write() += 1;
        }

        let active_connections = state.add_connection(connection_id, tx, now_millis()).await;

        Registration {
            receiver: rx,
            active_connections,
            total_rooms: *self.inner.total_rooms.read(),
        }
    }

    pub async fn unregister(&self, room_id: &str, connection_id: Uuid) -> Removal {
        let mut active_connections = 0usize;

        if let Some(entry) = self.inner.rooms.get(room_id) {
            let state = Arc::clone(entry.value());
            drop(entry);

            active_connections = state.remove_connection(connection_id).await;
            if active_connections == 0
                && self
                    .inner
                    .rooms
                    .remove_if(room_id, |_, arc| Arc::ptr_eq(arc, &state))
                    .is_some()
            {
                *self.inner.total_rooms.write() -= 1;
            }
        }

        Removal {
            active_connections,
            total_rooms: *self.inner.total_rooms.read(),
        }
    }

    /// Fans `message` out to the room. The sender is included unless
    /// `echo_to_sender` is off.
    pub async fn broadcast(
        &self,
        room_id: &str,
        source_id: Uuid,
        message: Message,
    ) -> BroadcastMetrics {
        match self.room(room_id) {
            Some(state) => {
                state
                    .broadcast(source_id, message, self.inner.config.echo_to_sender)
                    .await
            }
            None => BroadcastMetrics::default(),
        }
    }

    /// Queues `message` for one connection only. Returns false when the
    /// connection is gone or its buffer is full.
    pub async fn send_to(&self, room_id: &str, connection_id: Uuid, message: Message) -> bool {
        let Some(state) = self.room(room_id) else {
            return false;
        };
        match state.sender_for(connection_id).await {
            Some(sender) => sender.try_send(message).is_ok(),
            None => false,
        }
    }

    pub async fn touch(&self, room_id: &str, connection_id: Uuid) {
        if let Some(state) = self.room(room_id) {
            state.touch(connection_id, now_millis()).await;
        }
    }

    /// Asks every member of the room to close. Returns how many were asked.
    pub async fn close_room(&self, room_id: &str, reason: &str) -> usize {
        let Some(state) = self.room(room_id) else {
            return 0;
        };
        let senders = state.senders().await;
        for sender in &senders {
            let _ = sender.try_send(close_message(close_code::AWAY, reason));
        }
        senders.len()
    }

    pub async fn force_close_idle(&self, now: u64) -> usize {
        let mut idle_total = 0usize;
        let room_ids: Vec<String> = self
            .inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for room_id in room_ids {
            let Some(state) = self.room(&room_id) else {
                continue;
            };

            let idle = state.collect_idle(now, self.inner.config.idle_timeout).await;
            for connection_id in idle {
                if let Some(sender) = state.sender_for(connection_id).await {
                    counter!(
                        "tandem_relay_idle_pruned_total",
                        1,
                        "room_id" => room_id.clone()
                    );
                    let _ = sender.try_send(close_message(close_code::POLICY, "idle timeout"));
                }

                let removal = self.unregister(&room_id, connection_id).await;
                if removal.active_connections == 0 {
                    counter!("tandem_relay_rooms_emptied_total", 1);
                }
                idle_total += 1;
            }
        }

        idle_total
    }

    pub async fn snapshot(&self) -> Vec<RoomSnapshot> {
        let room_ids: Vec<String> = self
            .inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut snapshots = Vec::with_capacity(room_ids.len());
        for room_id in room_ids {
            if let Some(state) = self.room(&room_id) {
                let connections = state.connection_count().await;
                snapshots.push(RoomSnapshot {
                    room_id,
                    connections,
                });
            }
        }
        snapshots.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        snapshots
    }

    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.recycle_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let pruned = registry.force_close_idle(now_millis()).await;
                if pruned > 0 {
                    debug!(pruned, "closed idle room connections");
                }
            }
        })
    }

    fn room(&self, room_id: &str) -> Option<Arc<RoomState>> {
        self.inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
    }
}

struct RoomState {
    room_id: String,
    inner: Mutex<RoomStateInner>,
}

struct RoomStateInner {
    slab: Slab<ConnectionEntry>,
    index_map: HashMap<Uuid, usize>,
}

struct ConnectionEntry {
    id: Uuid,
    sender: mpsc::Sender<Message>,
    last_activity: AtomicU64,
}

impl RoomState {
    fn new(room_id: String) -> Self {
        Self {
            room_id,
            inner: Mutex::new(RoomStateInner {
                slab: Slab::new(),
                index_map: HashMap::new(),
            }),
        }
    }

    async fn add_connection(
        &self,
        connection_id: Uuid,
        sender: mpsc::Sender<Message>,
        now: u64,
    ) -> usize {
        let mut guard = self.inner.lock().await;
        let key = guard.slab.insert(ConnectionEntry {
            id: connection_id,
            sender,
            last_activity: AtomicU64::new(now),
        });
        guard.index_map.insert(connection_id, key);
        guard.slab.len()
    }

    async fn remove_connection(&self, connection_id: Uuid) -> usize {
        let mut guard = self.inner.lock().await;
        if let Some(index) = guard.index_map.remove(&connection_id) {
            guard.slab.remove(index);
        }
        guard.slab.len()
    }

    async fn touch(&self, connection_id: Uuid, now: u64) {
        let guard = self.inner.lock().await;
        if let Some(entry) = guard
            .index_map
            .get(&connection_id)
            .and_then(|index| guard.slab.get(*index))
        {
            entry.last_activity.store(now, Ordering::Relaxed);
        }
    }

    async fn broadcast(&self, source_id: Uuid, message: Message, echo: bool) -> BroadcastMetrics {
        let mut metrics = BroadcastMetrics::default();

        let pending: Vec<(Uuid, mpsc::Sender<Message>)> = {
            let guard = self.inner.lock().await;
            guard
                .slab
                .iter()
                .filter(|(_, entry)| echo || entry.id != source_id)
                .map(|(_, entry)| (entry.id, entry.sender.clone()))
                .collect()
        };

        let bytes = message_len(&message);
        for (connection_id, sender) in pending {
            match sender.try_send(message.clone()) {
                Ok(_) => {
                    metrics.delivered += 1;
                    metrics.bytes += bytes;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics.dropped += 1;
                    counter!(
                        "tandem_relay_flow_control_drops_total",
                        1,
                        "room_id" => self.room_id.clone()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    metrics.closed += 1;
                    self.remove_connection(connection_id).await;
                }
            }
        }

        metrics
    }

    async fn sender_for(&self, connection_id: Uuid) -> Option<mpsc::Sender<Message>> {
        let guard = self.inner.lock().await;
        guard
            .index_map
            .get(&connection_id)
            .and_then(|index| guard.slab.get(*index))
            .map(|entry| entry.sender.clone())
    }

    async fn senders(&self) -> Vec<mpsc::Sender<Message>> {
        let guard = self.inner.lock().await;
        guard
            .slab
            .iter()
            .map(|(_, entry)| entry.sender.clone())
            .collect()
    }

    async fn collect_idle(&self, now: u64, timeout: Duration) -> Vec<Uuid> {
        let guard = self.inner.lock().await;
        guard
            .slab
            .iter()
            .filter(|(_, entry)| {
                let last = entry.last_activity.load(Ordering::Relaxed);
                now.saturating_sub(last) > timeout.as_millis() as u64
            })
            .map(|(_, entry)| entry.id)
            .collect()
    }

    async fn connection_count(&self) -> usize {
        self.inner.lock().await.slab.len()
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Owned(reason.to_string()),
    }))
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Message {
        Message::Text(value.to_string())
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_including_sender() {
        let registry = RoomRegistry::new(RoomConfig::default());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = registry.register("room", a).await.receiver;
        let mut rx_b = registry.register("room", b).await.receiver;
        let mut rx_other = registry.register("other", Uuid::new_v4()).await.receiver;

        let metrics = registry.broadcast("room", a, text("hi")).await;
        assert_eq!(metrics.delivered, 2);
        assert_eq!(metrics.bytes, 4);

        assert!(matches!(rx_a.recv().await, Some(Message::Text(t)) if t == "hi"));
        assert!(matches!(rx_b.recv().await, Some(Message::Text(t)) if t == "hi"));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_can_skip_sender() {
        let registry = RoomRegistry::new(RoomConfig {
            echo_to_sender: false,
            ..RoomConfig::default()
        });
        let a = Uuid::new_v4();
        let mut rx_a = registry.register("room", a).await.receiver;
        let mut rx_b = registry.register("room", Uuid::new_v4()).await.receiver;

        let metrics = registry.broadcast("room", a, text("hi")).await;
        assert_eq!(metrics.delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn unregister_drops_empty_rooms() {
        let registry = RoomRegistry::new(RoomConfig::default());
        let a = Uuid::new_v4();
        let registration = registry.register("room", a).await;
        assert_eq!(registration.active_connections, 1);
        assert_eq!(registration.total_rooms, 1);

        let removal = registry.unregister("room", a).await;
        assert_eq!(removal.active_connections, 0);
        assert_eq!(removal.total_rooms, 0);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn idle_connections_are_closed_and_removed() {
        let registry = RoomRegistry::new(RoomConfig {
            idle_timeout: Duration::from_millis(100),
            ..RoomConfig::default()
        });
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let mut rx_stale = registry.register("room", stale).await.receiver;
        let _rx_fresh = registry.register("room", fresh).await.receiver;

        let later = now_millis() + 1_000;
        registry.touch("room", fresh).await;
        if let Some(state) = registry.room("room") {
            state.touch(fresh, later).await;
        }

        let pruned = registry.force_close_idle(later).await;
        assert_eq!(pruned, 1);
        assert!(matches!(rx_stale.recv().await, Some(Message::Close(_))));

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].connections, 1);
    }

    #[tokio::test]
    async fn close_room_asks_every_member_to_leave() {
        let registry = RoomRegistry::new(RoomConfig::default());
        let mut rx_a = registry.register("room", Uuid::new_v4()).await.receiver;
        let mut rx_b = registry.register("room", Uuid::new_v4()).await.receiver;

        assert_eq!(registry.close_room("room", "maintenance").await, 2);
        assert!(matches!(rx_a.recv().await, Some(Message::Close(Some(frame))) if frame.reason == "maintenance"));
        assert!(matches!(rx_b.recv().await, Some(Message::Close(_))));
        assert_eq!(registry.close_room("missing", "maintenance").await, 0);
    }

    #[tokio::test]
    async fn send_to_targets_one_connection() {
        let registry = RoomRegistry::new(RoomConfig::default());
        let a = Uuid::new_v4();
        let mut rx_a = registry.register("room", a).await.receiver;
        let mut rx_b = registry.register("room", Uuid::new_v4()).await.receiver;

        assert!(registry.send_to("room", a, text("ack")).await);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
        assert!(!registry.send_to("room", Uuid::new_v4(), text("ack")).await);
    }
}
