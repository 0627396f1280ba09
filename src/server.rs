//! Local relay server: the coordination surface between senders and
//! receivers.
//!
//! Serves both transports. The `/ws` endpoint carries the push channel
//! (keystrokes toward receivers, acks back toward senders), and the
//! `/api/rooms/{roomCode}/events` pair feeds the pull transport from a
//! per-room event store with bounded retention.
//!
//! # Architecture
//!
//! ```text
//! phone browser ──→ /ws ──→ relay ──→ /ws ──→ desktop executor
//!                             │
//!                             └──→ room store ──→ GET ?since=N (pull)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::protocol::{Ack, ControlMessage, EventKind, KeyEvent, Role, WireMessage};

/// How long an untouched room keeps its events.
const EVENT_RETENTION: Duration = Duration::from_secs(30 * 60);
/// Cap on stored events per room; the oldest are shed past this.
const MAX_EVENTS_PER_ROOM: usize = 1000;
/// Implicit session for connections that never join a room: in local
/// mode the channel itself defines the session.
const LOCAL_SESSION: &str = "";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random).
    pub port: u16,
}

impl ServerConfig {
    /// Configuration binding localhost on the given port.
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// One event queued in a room store, as served to pull clients.
#[derive(Debug, Clone, Serialize)]
struct StoredEvent {
    id: u64,
    #[serde(rename = "type")]
    kind: EventKind,
    payload: String,
    ts: DateTime<Utc>,
}

/// Per-room event queue feeding the pull transport.
struct RoomStore {
    events: Vec<StoredEvent>,
    next_id: u64,
    last_touched: DateTime<Utc>,
}

impl RoomStore {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
            last_touched: Utc::now(),
        }
    }

    fn queue(&mut self, kind: EventKind, payload: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push(StoredEvent {
            id,
            kind,
            payload,
            ts: Utc::now(),
        });
        if self.events.len() > MAX_EVENTS_PER_ROOM {
            let excess = self.events.len() - MAX_EVENTS_PER_ROOM;
            self.events.drain(..excess);
        }
        id
    }
}

/// A live WebSocket member of a room.
struct RoomMember {
    conn_id: u64,
    role: Role,
    tx: mpsc::UnboundedSender<WireMessage>,
}

/// Shared server state.
struct ServerState {
    /// Durable-ish event queues, keyed by room code.
    rooms: Mutex<HashMap<String, RoomStore>>,
    /// Live WebSocket connections, keyed by room code.
    members: Mutex<HashMap<String, Vec<RoomMember>>>,
    next_conn_id: AtomicU64,
}

impl ServerState {
    fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Drop rooms whose stores were not touched within the retention
    /// window. Ran on every API touch rather than on a timer.
    async fn prune_expired_rooms(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(EVENT_RETENTION).unwrap_or_else(|_| chrono::Duration::zero());
        self.rooms
            .lock()
            .await
            .retain(|_, store| store.last_touched >= cutoff);
    }

    async fn queue_event(&self, room_code: &str, kind: EventKind, payload: String) -> u64 {
        let mut rooms = self.rooms.lock().await;
        let store = rooms
            .entry(room_code.to_string())
            .or_insert_with(RoomStore::new);
        store.last_touched = Utc::now();
        store.queue(kind, payload)
    }

    /// Forward a message to every member of a room holding the given
    /// role, excluding the originating connection. With no role filter
    /// the message goes to every other member.
    async fn forward(
        &self,
        room_code: &str,
        to_role: Option<Role>,
        from_conn: u64,
        message: WireMessage,
    ) {
        let members = self.members.lock().await;
        if let Some(room) = members.get(room_code) {
            for member in room {
                if member.conn_id != from_conn && to_role.map_or(true, |r| member.role == r) {
                    let _ = member.tx.send(message.clone());
                }
            }
        }
    }

    /// Tell everyone else in a room that a peer joined.
    async fn notify_joined(&self, room_code: &str, from_conn: u64, role: Role) {
        let members = self.members.lock().await;
        if let Some(room) = members.get(room_code) {
            for member in room {
                if member.conn_id != from_conn {
                    let _ = member
                        .tx
                        .send(WireMessage::Control(ControlMessage::UserJoined { role }));
                }
            }
        }
    }

    async fn register(&self, room_code: &str, member: RoomMember) {
        self.members
            .lock()
            .await
            .entry(room_code.to_string())
            .or_default()
            .push(member);
    }

    async fn unregister(&self, room_code: &str, conn_id: u64) {
        let mut members = self.members.lock().await;
        if let Some(room) = members.get_mut(room_code) {
            room.retain(|m| m.conn_id != conn_id);
            if room.is_empty() {
                members.remove(room_code);
            }
        }
    }
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    mode: String,
}

/// Body of `POST /api/rooms/{roomCode}/events`. Parsed from a raw
/// value so missing or unknown fields answer 400 rather than the
/// extractor's 422.
#[derive(Deserialize)]
struct IngestEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    payload: String,
}

/// Query string of the pull endpoint.
#[derive(Deserialize)]
struct SinceQuery {
    since: Option<u64>,
}

/// Response of the pull endpoint.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    events: Vec<StoredEvent>,
    next_since: u64,
}

/// GET /api/health
async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    state.prune_expired_rooms().await;
    Json(HealthResponse {
        ok: true,
        mode: "local".to_string(),
    })
}

/// POST /api/rooms/{roomCode}/events
///
/// Queues an event for pull clients without touching the push path.
/// Accepted events answer 202 with the store-assigned id.
async fn ingest_event(
    State(state): State<Arc<ServerState>>,
    Path(room_code): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    // Only missing fields are rejected; an empty payload is stored as
    // given and left for the executor to drop as malformed.
    let event: IngestEvent = match serde_json::from_value(body) {
        Ok(event) => event,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "roomCode, type and payload are required" })),
            );
        }
    };
    if room_code.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "roomCode, type and payload are required" })),
        );
    }
    state.prune_expired_rooms().await;
    let event_id = state
        .queue_event(&room_code, event.kind, event.payload)
        .await;
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true, "eventId": event_id })),
    )
}

/// GET /api/rooms/{roomCode}/events?since=N
///
/// Events with ids past the cursor, oldest first. `nextSince` echoes
/// the cursor back when nothing is new, so pollers can always feed the
/// response straight into their next request.
async fn list_events(
    State(state): State<Arc<ServerState>>,
    Path(room_code): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Json<EventsResponse> {
    let since = query.since.unwrap_or(0);
    state.prune_expired_rooms().await;

    let mut rooms = state.rooms.lock().await;
    let store = rooms.entry(room_code).or_insert_with(RoomStore::new);
    store.last_touched = Utc::now();

    let events: Vec<StoredEvent> = store
        .events
        .iter()
        .filter(|e| e.id > since)
        .cloned()
        .collect();
    let next_since = events.last().map_or(since, |e| e.id);
    Json(EventsResponse { events, next_since })
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One WebSocket connection's session loop.
///
/// A connection starts roomless in the implicit local session and may
/// move itself with a `join-room` message (internet mode). Keystrokes
/// are queued for pull clients and forwarded onward; inside a room
/// they reach receivers only and acks flow back to senders, while the
/// local session forwards both to every other member.
async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();

    // Roomless connections never declare a role. In the local session
    // keystrokes go to every other member, so the registered role only
    // matters once the connection joins a room.
    let mut room_code = LOCAL_SESSION.to_string();
    state
        .register(
            &room_code,
            RoomMember {
                conn_id,
                role: Role::Sender,
                tx: tx.clone(),
            },
        )
        .await;
    info!(conn_id, "websocket connected");

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(message) = outgoing else { break };
                let Ok(payload) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WireMessage>(&text) {
                            Ok(WireMessage::Control(ControlMessage::JoinRoom {
                                room_code: new_room,
                                role,
                            })) => {
                                if new_room.is_empty() {
                                    debug!(conn_id, "ignoring join with empty room code");
                                    continue;
                                }
                                state.unregister(&room_code, conn_id).await;
                                room_code = new_room;
                                state
                                    .register(
                                        &room_code,
                                        RoomMember { conn_id, role, tx: tx.clone() },
                                    )
                                    .await;
                                info!(conn_id, room = %room_code, ?role, "joined room");
                                state.notify_joined(&room_code, conn_id, role).await;
                            }
                            Ok(WireMessage::Event(event)) => {
                                handle_keystroke(&state, &room_code, conn_id, event).await;
                            }
                            Ok(WireMessage::Ack(ack)) => {
                                let room = ack_room(&ack).unwrap_or(&room_code).to_string();
                                let to_role =
                                    (room != LOCAL_SESSION).then_some(Role::Sender);
                                state
                                    .forward(&room, to_role, conn_id, WireMessage::Ack(ack))
                                    .await;
                            }
                            Ok(WireMessage::Control(_)) => {}
                            Err(e) => debug!(conn_id, error = %e, "dropping unparseable frame"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conn_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.unregister(&room_code, conn_id).await;
    info!(conn_id, "websocket disconnected");
}

/// Queue a keystroke for pull clients and forward it onward. In a
/// joined room only receivers get it; in the implicit local session
/// every other member does, since roomless connections carry no role.
/// Malformed events leave no trace on the wire.
async fn handle_keystroke(
    state: &Arc<ServerState>,
    current_room: &str,
    conn_id: u64,
    event: KeyEvent,
) {
    if !event.is_well_formed() {
        debug!(conn_id, "dropping malformed event");
        return;
    }
    let room = event
        .room_code
        .clone()
        .unwrap_or_else(|| current_room.to_string());
    state
        .queue_event(&room, event.kind, event.payload.clone())
        .await;
    let to_role = (room != LOCAL_SESSION).then_some(Role::Receiver);
    state
        .forward(&room, to_role, conn_id, WireMessage::Event(event))
        .await;
}

/// Room an ack is addressed to, when it names one (internet mode).
fn ack_room(ack: &Ack) -> Option<&str> {
    match ack {
        Ack::ExecutionAck { room_code, .. } => room_code.as_deref(),
        Ack::DeliveryAck { .. } => None,
    }
}

/// Run the relay server. Returns the bound address and a shutdown
/// handle.
pub async fn run(
    config: ServerConfig,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let state = Arc::new(ServerState::new());

    let app = Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/rooms/:room_code/events",
            post(ingest_event).get(list_events),
        )
        .route("/ws", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("relay server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("server shutdown signal received");
            })
            .await
        {
            tracing::error!("server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
