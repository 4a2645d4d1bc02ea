#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tandem_client::{ChannelEvent, ChannelSettings, ReactionReport, RoomChannel, StaticTokenProvider};
use tandem_core::{
    ConfigPatch, ConfigStore, InMemoryConfigStore, Notifier, SessionConfig, ServerSettings,
};
use tandem_server::{relay, RelayConfig, RelayHandle, RoomConfig};
use tokio::sync::{broadcast, mpsc};

pub const TOKEN: &str = "integration-token";
pub const ROOM: &str = "team-a";

pub async fn start_relay() -> RelayHandle {
    start_relay_with(RoomConfig::default()).await
}

pub async fn start_relay_with(rooms: RoomConfig) -> RelayHandle {
    let mut config = RelayConfig::local().with_token(TOKEN);
    config.rooms = rooms;
    relay::spawn(config, None).await.expect("relay starts")
}

pub fn fast_settings() -> ChannelSettings {
    ChannelSettings {
        heartbeat_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(50),
    }
}

pub struct Client {
    pub channel: RoomChannel,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub store: Arc<InMemoryConfigStore>,
}

pub fn store_for(relay: &RelayHandle, room: &str) -> Arc<InMemoryConfigStore> {
    Arc::new(InMemoryConfigStore::new(SessionConfig {
        server: ServerSettings {
            base_url: relay.base_url(),
            room_id: room.to_string(),
        },
        sync_data: None,
    }))
}

pub fn client(relay: &RelayHandle, notifier: Arc<dyn Notifier>) -> Client {
    client_with_token(relay, TOKEN, notifier)
}

pub fn client_with_token(relay: &RelayHandle, token: &str, notifier: Arc<dyn Notifier>) -> Client {
    let store = store_for(relay, ROOM);
    let (channel, events) = RoomChannel::new(
        Arc::new(StaticTokenProvider::new(token)),
        store.clone(),
        notifier,
        fast_settings(),
    );
    Client {
        channel,
        events,
        store,
    }
}

pub async fn set_room(store: &InMemoryConfigStore, room: &str) {
    store.set(ConfigPatch::room(room)).await.expect("store");
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn room_members(relay: &RelayHandle, room: &str) -> usize {
    relay
        .registry()
        .snapshot()
        .await
        .into_iter()
        .find(|snapshot| snapshot.room_id == room)
        .map(|snapshot| snapshot.connections)
        .unwrap_or(0)
}

pub async fn wait_for_members(relay: &RelayHandle, room: &str, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let members = room_members(relay, room).await;
        if members == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "room {room} has {members} members, expected {expected}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn next_closed(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> u64 {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("event stream open");
        if let ChannelEvent::Closed { channel_id, .. } = event {
            return channel_id;
        }
    }
}

pub async fn next_report<F>(reports: &mut broadcast::Receiver<ReactionReport>, mut matches: F) -> ReactionReport
where
    F: FnMut(&ReactionReport) -> bool,
{
    loop {
        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .expect("reaction before timeout")
            .expect("reaction stream open");
        if matches(&report) {
            return report;
        }
    }
}
