use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tandem_core::{encode, ConfigStore, Message, Notifier, SessionConfig, SyncError, SyncResult, TokenProvider};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where a channel connects: `<base_url>/room/<room_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub base_url: String,
    pub room_id: String,
}

impl ChannelTarget {
    pub fn new(base_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            room_id: room_id.into(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> SyncResult<Self> {
        let room_id = config
            .room_id()
            .ok_or_else(|| SyncError::Config("no room configured".into()))?;
        Ok(Self::new(config.server.base_url.trim(), room_id))
    }

    /// Resolves the websocket URL. `http(s)` bases are rewritten to `ws(s)`.
    pub fn room_url(&self) -> SyncResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| SyncError::Connection(format!("invalid base url '{}': {err}", self.base_url)))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(SyncError::Connection(format!(
                    "unsupported url scheme '{other}'"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Connection(format!("cannot use scheme {scheme}")))?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Connection(format!("invalid base url '{}'", self.base_url)))?
            .pop_if_empty()
            .push("room")
            .push(&self.room_id);
        Ok(url)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Emitted by a channel's socket task. `channel_id` lets consumers ignore
/// events from channels that have since been replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame {
        channel_id: u64,
        room_id: String,
        text: String,
    },
    Closed {
        channel_id: u64,
        room_id: String,
    },
}

/// How a close event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// The live channel dropped on its own; one reconnect is scheduled.
    Reconnect,
    /// The channel was closed by `disconnect`.
    Intentional,
    /// The event belongs to a channel that is no longer current.
    Stale,
}

fn classify_close(current: Option<u64>, connected: bool, closed: u64) -> CloseDisposition {
    match current {
        Some(id) if id == closed && connected => CloseDisposition::Reconnect,
        Some(id) if id == closed => CloseDisposition::Intentional,
        Some(_) => CloseDisposition::Stale,
        None if connected => CloseDisposition::Stale,
        None => CloseDisposition::Intentional,
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct ChannelHandle {
    id: u64,
    room_id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ChannelHandle {
    fn close(self) {
        debug!(target: "tandem::channel", channel_id = self.id, room_id = %self.room_id, "closing channel");
        let _ = self.outbound.send(Outbound::Close);
    }
}

#[derive(Default)]
struct ChannelState {
    channel: Option<ChannelHandle>,
    connected: bool,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// Bumped by every `connect` and `disconnect`. A handshake that finishes
    /// under an older epoch is discarded instead of installed.
    epoch: u64,
}

impl ChannelState {
    /// Detaches the live channel and its timers so they can be shut down
    /// outside the lock.
    fn retire(&mut self) -> Retired {
        self.connected = false;
        Retired {
            channel: self.channel.take(),
            heartbeat: self.heartbeat.take(),
        }
    }
}

struct Retired {
    channel: Option<ChannelHandle>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Retired {
    fn shutdown(self) -> bool {
        if let Some(heartbeat) = self.heartbeat {
            heartbeat.abort();
        }
        match self.channel {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }
}

struct ChannelInner {
    state: Mutex<ChannelState>,
    next_id: AtomicU64,
    reconnects_scheduled: AtomicU64,
    tokens: Arc<dyn TokenProvider>,
    store: Arc<dyn ConfigStore>,
    notifier: Arc<dyn Notifier>,
    settings: ChannelSettings,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

/// The one live websocket to the relay for this machine. Cloning shares the
/// same channel.
#[derive(Clone)]
pub struct RoomChannel {
    inner: Arc<ChannelInner>,
}

impl RoomChannel {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        store: Arc<dyn ConfigStore>,
        notifier: Arc<dyn Notifier>,
        settings: ChannelSettings,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState::default()),
                next_id: AtomicU64::new(0),
                reconnects_scheduled: AtomicU64::new(0),
                tokens,
                store,
                notifier,
                settings,
                events,
            }),
        };
        (channel, receiver)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn current_channel_id(&self) -> Option<u64> {
        self.inner.state.lock().channel.as_ref().map(|channel| channel.id)
    }

    pub fn reconnects_scheduled(&self) -> u64 {
        self.inner.reconnects_scheduled.load(Ordering::SeqCst)
    }

    /// Opens a channel to `target`, retiring any previous one first. Returns
    /// the new channel id.
    pub async fn connect(&self, target: ChannelTarget) -> SyncResult<u64> {
        let epoch = self.begin_epoch();
        self.open(target, epoch).await
    }

    /// Re-reads the target from the config store and connects to it.
    pub async fn reconnect(&self) -> SyncResult<u64> {
        let epoch = self.begin_epoch();
        self.reconnect_within(epoch).await
    }

    /// Closes the live channel without scheduling a reconnect, and cancels
    /// any reconnect or handshake still in flight. A no-op when nothing is
    /// connected.
    pub fn disconnect(&self) {
        let (epoch, retired) = self.advance_epoch();
        if !retired {
            debug!(target: "tandem::channel", epoch, "disconnect with no active channel");
        }
    }

    fn begin_epoch(&self) -> u64 {
        let (epoch, retired) = self.advance_epoch();
        if retired {
            debug!(target: "tandem::channel", epoch, "retired previous channel");
        }
        epoch
    }

    /// Retires the live channel, aborts a pending reconnect and starts a new
    /// epoch. Returns the epoch and whether a channel was retired.
    fn advance_epoch(&self) -> (u64, bool) {
        let (epoch, retired, pending) = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            (state.epoch, state.retire(), state.reconnect.take())
        };
        if let Some(pending) = pending {
            pending.abort();
        }
        (epoch, retired.shutdown())
    }

    fn is_current_epoch(&self, epoch: u64) -> bool {
        self.inner.state.lock().epoch == epoch
    }

    async fn reconnect_within(&self, epoch: u64) -> SyncResult<u64> {
        let config = self.inner.store.get().await?;
        let target = ChannelTarget::from_config(&config)?;
        self.open(target, epoch).await
    }

    async fn open(&self, target: ChannelTarget, epoch: u64) -> SyncResult<u64> {
        let url = target.room_url()?;
        let token = self.inner.tokens.token().await.map_err(|err| match err {
            SyncError::Auth(_) => err,
            other => SyncError::Auth(other.to_string()),
        })?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| SyncError::Connection(err.to_string()))?;
        let header = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| SyncError::Auth("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (socket, _) = connect_async(request)
            .await
            .map_err(|err| SyncError::Connection(format!("{url}: {err}")))?;

        let mut socket = Some(socket);
        let installed = {
            let mut state = self.inner.state.lock();
            match socket.take() {
                Some(socket) if state.epoch == epoch => {
                    let channel_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let (outbound, outbound_rx) = mpsc::unbounded_channel();
                    tokio::spawn(run_socket(
                        channel_id,
                        target.room_id.clone(),
                        socket,
                        outbound_rx,
                        self.inner.events.clone(),
                    ));
                    let heartbeat = spawn_heartbeat(
                        Arc::downgrade(&self.inner),
                        self.inner.settings.heartbeat_interval,
                    );
                    let replaced = state.retire();
                    state.channel = Some(ChannelHandle {
                        id: channel_id,
                        room_id: target.room_id.clone(),
                        outbound,
                    });
                    state.heartbeat = Some(heartbeat);
                    state.connected = true;
                    Some((channel_id, replaced))
                }
                other => {
                    socket = other;
                    None
                }
            }
        };

        let Some((channel_id, replaced)) = installed else {
            debug!(
                target: "tandem::channel",
                room_id = %target.room_id,
                "connect was cancelled during the handshake"
            );
            if let Some(mut socket) = socket {
                let _ = socket.close(None).await;
            }
            return Err(SyncError::NotConnected);
        };
        replaced.shutdown();

        self.send(&Message::Hello)?;
        info!(
            target: "tandem::channel",
            room_id = %target.room_id,
            channel_id,
            url = %url,
            "joined room"
        );
        Ok(channel_id)
    }

    /// Writes one envelope to the live channel.
    pub fn send(&self, message: &Message) -> SyncResult<()> {
        let text = encode(message)?;
        let state = self.inner.state.lock();
        let channel = state.channel.as_ref().ok_or(SyncError::NotConnected)?;
        channel
            .outbound
            .send(Outbound::Text(text))
            .map_err(|_| SyncError::NotConnected)
    }

    /// Reacts to a `Closed` event from the socket task. Only an unexpected
    /// close of the current channel schedules a reconnect.
    pub fn handle_closed(&self, channel_id: u64) -> CloseDisposition {
        let mut state = self.inner.state.lock();
        let current = state.channel.as_ref().map(|channel| channel.id);
        let disposition = classify_close(current, state.connected, channel_id);
        match disposition {
            CloseDisposition::Reconnect => {
                let retired = state.retire();
                if let Some(pending) = state.reconnect.take() {
                    pending.abort();
                }
                state.reconnect = Some(self.spawn_reconnect(state.epoch));
                drop(state);
                retired.shutdown();
                self.inner.reconnects_scheduled.fetch_add(1, Ordering::SeqCst);
                warn!(
                    target: "tandem::channel",
                    channel_id,
                    delay_ms = self.inner.settings.reconnect_delay.as_millis() as u64,
                    "channel closed unexpectedly; reconnect scheduled"
                );
            }
            CloseDisposition::Intentional => {
                if current == Some(channel_id) {
                    state.channel = None;
                }
                debug!(target: "tandem::channel", channel_id, "channel closed");
            }
            CloseDisposition::Stale => {
                debug!(target: "tandem::channel", channel_id, "ignoring close of retired channel");
            }
        }
        disposition
    }

    /// Retries after a fixed delay until a channel is installed or the epoch
    /// moves on. A failed attempt counts as another close.
    fn spawn_reconnect(&self, epoch: u64) -> JoinHandle<()> {
        let channel = self.clone();
        let delay = self.inner.settings.reconnect_delay;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                match channel.reconnect_within(epoch).await {
                    Ok(channel_id) => {
                        debug!(target: "tandem::channel", channel_id, "reconnected");
                        break;
                    }
                    Err(_) if !channel.is_current_epoch(epoch) => break,
                    Err(err) => {
                        warn!(
                            target: "tandem::channel",
                            reason = err.label(),
                            error = %err,
                            "reconnect failed; retrying"
                        );
                        channel
                            .inner
                            .notifier
                            .error(&format!("reconnect failed: {err}"));
                        channel
                            .inner
                            .reconnects_scheduled
                            .fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        })
    }
}

fn spawn_heartbeat(inner: Weak<ChannelInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let channel = RoomChannel { inner };
            if let Err(err) = channel.send(&Message::KeepAlive) {
                debug!(target: "tandem::channel", error = %err, "stopping heartbeat");
                break;
            }
        }
    })
}

async fn run_socket(
    channel_id: u64,
    room_id: String,
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = sink.send(WsMessage::Text(text)).await {
                        warn!(target: "tandem::channel", channel_id, error = %err, "write failed");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = events.send(ChannelEvent::Frame {
                        channel_id,
                        room_id: room_id.clone(),
                        text,
                    });
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = events.send(ChannelEvent::Frame {
                            channel_id,
                            room_id: room_id.clone(),
                            text,
                        });
                    }
                    Err(_) => warn!(target: "tandem::channel", channel_id, "dropping non-utf8 frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(
                        target: "tandem::channel",
                        channel_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "relay closed channel"
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target: "tandem::channel", channel_id, error = %err, "read failed");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(ChannelEvent::Closed {
        channel_id,
        room_id,
    });
}
