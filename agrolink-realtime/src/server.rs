//! WebSocket relay speaking the channel protocol.
//!
//! ```text
//! Client A ──┐                         ┌── room "s-1" ── BroadcastGroup ──┐
//!            ├── handshake (Bearer) ───┤                                  ├─► other members
//! Client B ──┘                         └── room "s-2" ── BroadcastGroup ──┘
//!
//! RelayHandle::push_notification ──► server-wide push channel ──► every connection
//! ```
//!
//! The relay keeps no history: `join_room` adds the connection to the room's
//! broadcast group and answers `room_joined`; `send_message`, `typing` and
//! `stop_typing` fan out to the *other* members. Anything sent to a room the
//! connection has not joined is answered with `chat_error`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{RelayFrame, RoomManager};
use crate::config::parse_var;
use crate::error::{ConfigError, ProtocolError};
use crate::protocol::{
    ChatErrorPayload, ChatMessage, InboundEvent, MessageId, Notification, OutboundEvent,
    OutgoingMessage, RoomRef, SenderRole, Timestamp, TypingPayload,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames a member may fall behind before dropping
    pub broadcast_capacity: usize,
    /// Maximum members per room
    pub max_peers_per_room: usize,
    /// Bearer tokens allowed to connect; `None` accepts any non-empty token
    pub accepted_tokens: Option<HashSet<String>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
            accepted_tokens: None,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `AGROLINK_RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup("AGROLINK_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(capacity) = parse_var(&lookup, "AGROLINK_RELAY_BROADCAST_CAPACITY")? {
            config.broadcast_capacity = capacity;
        }
        if let Some(max) = parse_var(&lookup, "AGROLINK_RELAY_MAX_PEERS")? {
            config.max_peers_per_room = max;
        }
        if let Some(raw) = lookup("AGROLINK_RELAY_TOKENS") {
            let tokens: HashSet<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            config.accepted_tokens = (!tokens.is_empty()).then_some(tokens);
        }
        Ok(config)
    }

    fn accepts(&self, token: &str) -> bool {
        self.accepted_tokens
            .as_ref()
            .map_or(true, |tokens| tokens.contains(token))
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

struct RelayShared {
    config: RelayConfig,
    rooms: RoomManager,
    stats: AtomicRelayStats,
    push: broadcast::Sender<Arc<String>>,
}

/// The relay server, bound and ready to [`run`](RelayServer::run).
pub struct RelayServer {
    listener: TcpListener,
    shared: Arc<RelayShared>,
}

impl RelayServer {
    /// Bind the listener. Use port 0 for an ephemeral port.
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let (push, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let shared = Arc::new(RelayShared {
            rooms: RoomManager::new(config.broadcast_capacity),
            config,
            stats: AtomicRelayStats::default(),
            push,
        });
        Ok(Self { listener, shared })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for pushing events and reading stats while the relay runs.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Spawn [`run`](RelayServer::run) onto the runtime.
    pub fn spawn(self) -> (RelayHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                log::error!("Relay stopped: {e}");
            }
        });
        (handle, task)
    }
}

/// Cloneable control handle for a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<RelayShared>,
}

impl RelayHandle {
    /// Push a `notification` to every connection. Returns how many
    /// connections it was queued for.
    pub fn push_notification(&self, notification: &Notification) -> Result<usize, ProtocolError> {
        self.push_event(&InboundEvent::Notification(notification.clone()))
    }

    /// Push any server event to every connection.
    pub fn push_event(&self, event: &InboundEvent) -> Result<usize, ProtocolError> {
        let text = event.encode()?;
        log::debug!("Pushing {} to all connections", event.name());
        Ok(self.shared.push.send(Arc::new(text)).unwrap_or(0))
    }

    pub async fn stats(&self) -> RelayStats {
        let stats = &self.shared.stats;
        RelayStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: stats.rejected_handshakes.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.shared.rooms.room_count().await,
        }
    }

    /// Active room ids, sorted.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.shared.rooms.active_rooms().await
    }

    /// Members of `room` (0 if the room does not exist).
    pub async fn room_size(&self, room: &str) -> usize {
        match self.shared.rooms.get(room).await {
            Some(group) => group.peer_count().await,
            None => 0,
        }
    }
}

/// `Authorization: Bearer <token>` from the upgrade request.
fn bearer_token(request: &Request) -> Option<&str> {
    let value = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Per-connection state.
struct PeerSession {
    peer_id: Uuid,
    /// Room → task forwarding that room's frames into `outbox`.
    memberships: HashMap<String, JoinHandle<()>>,
    outbox: mpsc::Sender<String>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<RelayShared>,
) -> Result<(), BoxError> {
    let gate = Arc::clone(&shared);
    let callback = move |request: &Request, response: Response| match bearer_token(request) {
        Some(token) if gate.config.accepts(token) => Ok(response),
        _ => {
            gate.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            Err(unauthorized())
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let (outbox, outbox_rx) = mpsc::channel(shared.config.broadcast_capacity.max(1));
    let mut peer = PeerSession {
        peer_id: Uuid::new_v4(),
        memberships: HashMap::new(),
        outbox,
    };
    log::info!("Peer {} connected from {addr}", peer.peer_id);
    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let result = serve(ws_stream, outbox_rx, &mut peer, &shared).await;

    // Cleanup: leave every room
    for (room, forwarder) in peer.memberships.drain() {
        forwarder.abort();
        shared.rooms.leave(&room, &peer.peer_id).await;
    }
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Peer {} disconnected", peer.peer_id);
    result
}

async fn serve(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut outbox_rx: mpsc::Receiver<String>,
    peer: &mut PeerSession,
    shared: &RelayShared,
) -> Result<(), BoxError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut push_rx = shared.push.subscribe();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        shared.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                        match OutboundEvent::decode(text.as_str()) {
                            Ok(event) => {
                                if let Some(reply) = handle_event(event, peer, shared).await {
                                    ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                }
                            }
                            Err(e) => log::warn!("Peer {}: undecodable frame: {e}", peer.peer_id),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::error!("WebSocket error from peer {}: {e}", peer.peer_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            Some(frame) = outbox_rx.recv() => {
                ws_sender.send(Message::Text(frame.into())).await?;
            }

            pushed = push_rx.recv() => {
                match pushed {
                    Ok(text) => ws_sender.send(Message::Text(text.to_string().into())).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {} missed {n} pushed event(s)", peer.peer_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    let _ = ws_sender.close().await;
    Ok(())
}

/// Apply one client event; returns the direct reply, if any.
async fn handle_event(
    event: OutboundEvent,
    peer: &mut PeerSession,
    shared: &RelayShared,
) -> Option<InboundEvent> {
    let room = event.session_id().to_string();
    match event {
        OutboundEvent::JoinRoom(_) => Some(join(room, peer, shared).await),
        OutboundEvent::LeaveRoom(_) => {
            if let Some(forwarder) = peer.memberships.remove(&room) {
                forwarder.abort();
                shared.rooms.leave(&room, &peer.peer_id).await;
                log::info!("Peer {} left {room}", peer.peer_id);
            }
            Some(InboundEvent::RoomLeft(RoomRef::new(room)))
        }
        OutboundEvent::SendMessage(message) => {
            if !peer.memberships.contains_key(&room) {
                return Some(not_joined(room));
            }
            fan_out(shared, peer.peer_id, &room, InboundEvent::Message(relayed_message(message)))
                .await
        }
        OutboundEvent::Typing(_) => typing(room, peer, shared, true).await,
        OutboundEvent::StopTyping(_) => typing(room, peer, shared, false).await,
    }
}

async fn typing(room: String, peer: &PeerSession, shared: &RelayShared, started: bool) -> Option<InboundEvent> {
    if !peer.memberships.contains_key(&room) {
        return Some(not_joined(room));
    }
    let payload = TypingPayload {
        session_id: room.clone(),
        user_id: Some(peer.peer_id.to_string()),
    };
    let relayed = if started {
        InboundEvent::Typing(payload)
    } else {
        InboundEvent::StopTyping(payload)
    };
    fan_out(shared, peer.peer_id, &room, relayed).await
}

async fn join(room: String, peer: &mut PeerSession, shared: &RelayShared) -> InboundEvent {
    if peer.memberships.contains_key(&room) {
        log::debug!("Peer {} already in {room}", peer.peer_id);
        return InboundEvent::RoomJoined(RoomRef::new(room));
    }

    match shared
        .rooms
        .join(&room, peer.peer_id, shared.config.max_peers_per_room)
        .await
    {
        Ok((group, rx)) => {
            let forwarder = tokio::spawn(forward(rx, group, peer.peer_id, peer.outbox.clone()));
            peer.memberships.insert(room.clone(), forwarder);
            log::info!("Peer {} joined {room}", peer.peer_id);
            InboundEvent::RoomJoined(RoomRef::new(room))
        }
        Err(_) => {
            log::warn!("Peer {} refused: {room} is full", peer.peer_id);
            InboundEvent::ChatError(ChatErrorPayload {
                message: "Room is full".to_string(),
                code: Some("room_full".to_string()),
                session_id: Some(room),
            })
        }
    }
}

/// Pump one room's frames into the connection's outbox, skipping its own.
async fn forward(
    mut rx: broadcast::Receiver<Arc<RelayFrame>>,
    group: Arc<crate::broadcast::BroadcastGroup>,
    peer_id: Uuid,
    outbox: mpsc::Sender<String>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if frame.origin == peer_id {
                    continue;
                }
                if outbox.send(frame.text.clone()).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_dropped(n);
                log::warn!("Peer {peer_id} lagged by {n} frame(s)");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn fan_out(shared: &RelayShared, origin: Uuid, room: &str, event: InboundEvent) -> Option<InboundEvent> {
    let group = shared.rooms.get(room).await?;
    match group.broadcast(origin, &event) {
        Ok(receivers) => {
            log::trace!("{} in {room} reached {} receiver(s)", event.name(), receivers.saturating_sub(1));
            None
        }
        Err(e) => Some(InboundEvent::ChatError(ChatErrorPayload {
            message: e.to_string(),
            code: Some("encode_failed".to_string()),
            session_id: Some(room.to_string()),
        })),
    }
}

fn relayed_message(message: OutgoingMessage) -> ChatMessage {
    ChatMessage {
        id: Some(MessageId::Text(Uuid::new_v4().to_string())),
        session_id: message.session_id,
        content: message.content,
        timestamp: Some(Timestamp::Millis(message.timestamp)),
        sender_role: SenderRole::User,
        metadata: message.metadata,
    }
}

fn not_joined(room: String) -> InboundEvent {
    InboundEvent::ChatError(ChatErrorPayload {
        message: "Not a member of this room".to_string(),
        code: Some("not_joined".to_string()),
        session_id: Some(room),
    })
}
