use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tandem_core::{decode, encode, Message as RoomMessage, MessageKind};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::registry::{RoomRegistry, RoomSnapshot};

const MAX_ROOM_ID_LEN: usize = 128;
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AppState {
    registry: RoomRegistry,
    tokens: HashSet<String>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: &RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            registry: RoomRegistry::new(config.rooms.clone()),
            tokens: config.tokens.clone(),
            metrics,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        if self.tokens.is_empty() {
            return Ok(());
        }
        let value = headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthRejection::Missing)?
            .to_str()
            .map_err(|_| AuthRejection::Malformed)?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or(AuthRejection::Malformed)?
            .trim();
        if self.tokens.contains(token) {
            Ok(())
        } else {
            Err(AuthRejection::Unknown)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum AuthRejection {
    Missing,
    Malformed,
    Unknown,
}

impl AuthRejection {
    fn metric_label(self) -> &'static str {
        match self {
            AuthRejection::Missing => "missing",
            AuthRejection::Malformed => "malformed",
            AuthRejection::Unknown => "unknown_token",
        }
    }
}

#[derive(Debug, Serialize)]
struct RoomsResponse {
    active_rooms: usize,
    active_connections: usize,
    rooms: Vec<RoomSnapshot>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/rooms", get(rooms_handler))
        .route("/debug/rooms/:room_id/close", post(close_room_handler))
        .route("/room/:room_id", get(room_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn rooms_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rooms = state.registry.snapshot().await;
    let active_connections = rooms.iter().map(|room| room.connections).sum();
    Json(RoomsResponse {
        active_rooms: rooms.len(),
        active_connections,
        rooms,
    })
}

async fn close_room_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = state.authorize(&headers) {
        warn!(reason = rejection.metric_label(), "rejected room close request");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let closed = state.registry.close_room(&room_id, "closed by operator").await;
    info!(room_id = %room_id, closed, "closing room");
    Json(json!({ "room_id": room_id, "closed": closed })).into_response()
}

async fn room_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !valid_room_id(&room_id) {
        counter!("tandem_relay_rejected_total", 1, "reason" => "invalid_room");
        return StatusCode::BAD_REQUEST.into_response();
    }
    match state.authorize(&headers) {
        Ok(()) => ws
            .on_upgrade(move |socket| handle_connection(socket, state, room_id))
            .into_response(),
        Err(rejection) => {
            counter!("tandem_relay_rejected_total", 1, "reason" => rejection.metric_label());
            warn!(
                room_id = %room_id,
                reason = rejection.metric_label(),
                "bearer token rejected"
            );
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

fn valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, room_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let connection_id = Uuid::new_v4();

    let registration = state.registry.register(&room_id, connection_id).await;
    gauge!(
        "tandem_relay_connections_active",
        registration.active_connections as f64,
        "room_id" => room_id.clone()
    );
    gauge!("tandem_relay_rooms_active", registration.total_rooms as f64);
    counter!("tandem_relay_connections_total", 1);
    let mut rx = registration.receiver;

    info!(
        room_id = %room_id,
        connection_id = %connection_id,
        members = registration.active_connections,
        "member joined room"
    );

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, &room_id, connection_id, text).await,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => handle_frame(&state, &room_id, connection_id, text).await,
                Err(_) => {
                    let notice = RoomMessage::error("frames must be utf-8 text");
                    reply(&state, &room_id, connection_id, notice).await;
                }
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                state.registry.touch(&room_id, connection_id).await;
            }
            Ok(Message::Close(frame)) => {
                debug!(
                    room_id = %room_id,
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "member closed websocket"
                );
                break;
            }
            Err(err) => {
                warn!(
                    room_id = %room_id,
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving frame"
                );
                break;
            }
        }
    }

    let removal = state.registry.unregister(&room_id, connection_id).await;
    gauge!(
        "tandem_relay_connections_active",
        removal.active_connections as f64,
        "room_id" => room_id.clone()
    );
    gauge!("tandem_relay_rooms_active", removal.total_rooms as f64);
    writer.abort();

    info!(
        room_id = %room_id,
        connection_id = %connection_id,
        members = removal.active_connections,
        "member left room"
    );
}

async fn handle_frame(state: &AppState, room_id: &str, connection_id: Uuid, text: String) {
    state.registry.touch(room_id, connection_id).await;

    let envelope = match decode(text.as_bytes()) {
        Ok(envelope) => envelope,
        Err(err) => {
            counter!("tandem_relay_malformed_frames_total", 1);
            reply(state, room_id, connection_id, RoomMessage::error(err.to_string())).await;
            return;
        }
    };

    match MessageKind::parse(&envelope.kind) {
        Some(MessageKind::Hello) => {
            reply(state, room_id, connection_id, RoomMessage::Hello).await;
        }
        Some(MessageKind::KeepAlive) | Some(MessageKind::Ack) => {}
        Some(MessageKind::Sync) => {
            reply(state, room_id, connection_id, RoomMessage::Ack).await;
            fan_out(state, room_id, connection_id, text).await;
        }
        Some(MessageKind::Error) | None => {
            fan_out(state, room_id, connection_id, text).await;
        }
    }
}

async fn fan_out(state: &AppState, room_id: &str, connection_id: Uuid, text: String) {
    let metrics = state
        .registry
        .broadcast(room_id, connection_id, Message::Text(text))
        .await;
    if metrics.delivered > 0 {
        counter!(
            "tandem_relay_messages_forwarded_total",
            metrics.delivered as u64,
            "room_id" => room_id.to_string()
        );
        histogram!(
            "tandem_relay_message_size_bytes",
            (metrics.bytes / metrics.delivered) as f64
        );
    }
    debug!(
        room_id = %room_id,
        delivered = metrics.delivered,
        dropped = metrics.dropped,
        "fanned out frame"
    );
}

async fn reply(state: &AppState, room_id: &str, connection_id: Uuid, message: RoomMessage) {
    match encode(&message) {
        Ok(text) => {
            if !state
                .registry
                .send_to(room_id, connection_id, Message::Text(text))
                .await
            {
                debug!(room_id = %room_id, connection_id = %connection_id, "reply dropped");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode relay reply"),
    }
}

/// A relay running on a background task, used by the binary and by tests.
pub struct RelayHandle {
    local_addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    recycler: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` base URL clients should use.
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn registry(&self) -> &RoomRegistry {
        self.state.registry()
    }

    /// Asks every member of `room_id` to leave. Returns how many were asked.
    pub async fn close_room(&self, room_id: &str) -> usize {
        self.state.registry.close_room(room_id, "closed by operator").await
    }

    /// Closes every room, waits `grace` for members to drain, then stops
    /// accepting connections.
    pub async fn shutdown(mut self, grace: Duration) {
        let rooms = self.state.registry.snapshot().await;
        for room in &rooms {
            self.state
                .registry
                .close_room(&room.room_id, "relay shutting down")
                .await;
        }
        if !rooms.is_empty() && !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.recycler.abort();
        if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut self.server)
            .await
            .is_err()
        {
            warn!("relay did not drain in time; aborting");
            self.server.abort();
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.recycler.abort();
        self.server.abort();
    }
}

pub async fn spawn(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<RelayHandle> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let local_addr = listener.local_addr().context("listener has no address")?;

    let state = Arc::new(AppState::new(&config, metrics));
    let recycler = state.registry.spawn_recycler();
    let app = router(state.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let graceful = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = graceful.await {
            warn!(error = %err, "relay server stopped with error");
        }
    });

    Ok(RelayHandle {
        local_addr,
        state,
        shutdown: Some(shutdown_tx),
        server,
        recycler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_ids_are_restricted() {
        assert!(valid_room_id("team-a_1.main"));
        assert!(!valid_room_id(""));
        assert!(!valid_room_id("has space"));
        assert!(!valid_room_id("../etc"));
        assert!(!valid_room_id(&"x".repeat(MAX_ROOM_ID_LEN + 1)));
    }

    #[test]
    fn bearer_tokens_are_checked() {
        let state = AppState::new(&RelayConfig::local().with_token("s3cret"), None);
        let mut headers = HeaderMap::new();
        assert!(matches!(state.authorize(&headers), Err(AuthRejection::Missing)));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(matches!(state.authorize(&headers), Err(AuthRejection::Malformed)));

        headers.insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(matches!(state.authorize(&headers), Err(AuthRejection::Unknown)));

        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        assert!(state.authorize(&headers).is_ok());
    }

    #[test]
    fn auth_is_open_without_tokens() {
        let state = AppState::new(&RelayConfig::local(), None);
        assert!(state.authorize(&HeaderMap::new()).is_ok());
    }
}
