//! The realtime channel: one persistent connection shared by every consumer.
//!
//! ```text
//!  callers ──join/leave/send/typing──► Session (outbox) ──► Link ──► server
//!                                          ▲
//!  TypingDebouncer ──countdown expiry──► forwarder task
//!
//!  server ──► Link ──► driver task ──dispatch──► rooms / messages /
//!                        │                       remote typing / notifications
//!                        └── reconnect with backoff           │
//!                                                             ▼
//!                                             broadcast<ChannelEvent>
//! ```
//!
//! Callers never wait on the network: outbound frames are queued on the
//! link's outbox with `try_send`. Results come back as state changes and
//! events.
//!
//! Every `connect` starts a new *generation*. The driver task carries the
//! generation it was spawned with and re-checks it under the session lock
//! before touching state, so a driver outlived by `disconnect()` (or by a
//! credential switch) can never resurrect the connection.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError, Weak};
use serde_json::{Map, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ChannelConfig;
use crate::connection::{ConnectionState, ReconnectPolicy, TransportEvent, Trigger};
use crate::error::ChannelError;
use crate::messages::MessageStream;
use crate::notifications::{HeadlessNotifier, NativeNotifier, NotificationDispatcher};
use crate::protocol::{
    ChatErrorPayload, ChatMessage, InboundEvent, Notification, NotificationRef, OutboundEvent,
    RoomRef, TypingPayload,
};
use crate::rooms::{JoinStatus, LeaveAction, LeaveStatus, RoomTracker};
use crate::transport::{Connector, Credential, Link, WsConnector};
use crate::typing::{RemoteTyping, TypingDebouncer, TypingSignal};
use crate::view::RoomView;

/// Everything consumers can observe on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    State(ConnectionState),
    Transport(TransportEvent),
    Message(ChatMessage),
    /// A remote participant started (`typing: true`) or stopped typing.
    Typing {
        session_id: String,
        user_id: Option<String>,
        typing: bool,
    },
    ChatError(ChatErrorPayload),
    RoomJoined(String),
    RoomLeft(String),
    Notification(Notification),
    NotificationRead(String),
    NotificationUpdated(Notification),
}

impl ChannelEvent {
    /// Room the event belongs to, if it is room-scoped.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ChannelEvent::Message(m) => Some(&m.session_id),
            ChannelEvent::Typing { session_id, .. } => Some(session_id),
            ChannelEvent::ChatError(e) => e.session_id.as_deref(),
            ChannelEvent::RoomJoined(room) | ChannelEvent::RoomLeft(room) => Some(room),
            ChannelEvent::State(_)
            | ChannelEvent::Transport(_)
            | ChannelEvent::Notification(_)
            | ChannelEvent::NotificationRead(_)
            | ChannelEvent::NotificationUpdated(_) => None,
        }
    }
}

struct Session {
    generation: u64,
    credential: Option<Credential>,
    /// Present exactly while the state is `connected`.
    outgoing: Option<mpsc::Sender<String>>,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    fn enqueue(&self, event: &OutboundEvent) -> Result<(), ChannelError> {
        let outgoing = self.outgoing.as_ref().ok_or(ChannelError::NotConnected)?;
        let frame = event.encode()?;
        outgoing.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::OutboxFull,
            TrySendError::Closed(_) => ChannelError::OutboxClosed,
        })
    }
}

struct Shared {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ChannelEvent>,
    /// Lock order: `session` before `rooms`.
    session: Mutex<Session>,
    rooms: Mutex<RoomTracker>,
    messages: RwLock<MessageStream>,
    typing: TypingDebouncer,
    remote_typing: StdMutex<RemoteTyping>,
    notifications: NotificationDispatcher,
}

/// Handle to the realtime channel. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    shared: Arc<Shared>,
}

impl RealtimeChannel {
    /// Create a disconnected channel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn NativeNotifier>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (typing, typing_expiries) = TypingDebouncer::new(config.typing_quiet_period);
        let remote_typing = RemoteTyping::new(config.typing_quiet_period);
        let notifications = NotificationDispatcher::new(config.notifications.clone(), notifier);

        let shared = Arc::new(Shared {
            config,
            connector,
            state_tx,
            events_tx,
            session: Mutex::new(Session {
                generation: 0,
                credential: None,
                outgoing: None,
                driver: None,
            }),
            rooms: Mutex::new(RoomTracker::new()),
            messages: RwLock::new(MessageStream::new()),
            typing,
            remote_typing: StdMutex::new(remote_typing),
            notifications,
        });

        spawn_typing_forwarder(Arc::downgrade(&shared), typing_expiries);
        Self { shared }
    }

    /// Channel over WebSocket to `config.url`, with the headless notifier.
    pub fn with_websocket(config: ChannelConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.url.clone(), config.outbox_capacity));
        Self::new(config, connector, Arc::new(HeadlessNotifier::default()))
    }

    /// Get the channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    // ── Connection ───────────────────────────────────────────────

    /// Start connecting with `credential`.
    ///
    /// No-op while already connecting, connected or reconnecting with the
    /// same credential. A different credential tears the current connection
    /// down first (rooms are released).
    pub async fn connect(&self, credential: impl Into<Credential>) -> Result<(), ChannelError> {
        let credential = credential.into();
        if credential.is_empty() {
            return Err(ChannelError::MissingCredential);
        }

        let shared = &self.shared;
        let mut session = shared.session.lock().await;

        let same_identity = session.credential.as_ref() == Some(&credential);
        if same_identity && self.state().is_live() {
            log::debug!("connect() ignored: already {}", self.state());
            return Ok(());
        }
        if session.credential.is_some() && !same_identity {
            log::info!("Credential changed; tearing down the current connection");
            shared.teardown(&mut session).await;
        }

        let generation = shared.bump_generation(&mut session);
        if let Some(driver) = session.driver.take() {
            driver.abort();
        }
        session.outgoing = None;
        session.credential = Some(credential.clone());
        shared.transition(Trigger::Connect);

        let driver = tokio::spawn(drive(
            Arc::downgrade(shared),
            Arc::clone(&shared.connector),
            shared.config.reconnect.clone(),
            generation,
            credential,
        ));
        session.driver = Some(driver);
        Ok(())
    }

    /// Tear the connection down and release every room, typing countdown and
    /// remote typing flag. No leave requests are sent.
    pub async fn disconnect(&self) {
        let mut session = self.shared.session.lock().await;
        self.shared.teardown(&mut session).await;
    }

    /// Disconnect and drop all local state (messages, notifications).
    pub async fn logout(&self) {
        self.disconnect().await;
        self.shared.messages.write().await.clear();
        self.shared.notifications.clear().await;
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch the connection state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Resolve once the state equals `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut changes = self.state_changes();
        // The sender lives in `self`, so the watch cannot close here.
        let _ = changes.wait_for(|state| *state == target).await;
    }

    /// Subscribe to channel events. Dropping the receiver detaches it.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events_tx.subscribe()
    }

    // ── Rooms ────────────────────────────────────────────────────

    /// Join `room`. Sent now when connected, queued otherwise.
    pub async fn join(&self, room: &str) -> Result<JoinStatus, ChannelError> {
        let session = self.shared.session.lock().await;
        let mut rooms = self.shared.rooms.lock().await;

        if !rooms.request_join(room) {
            log::debug!("join({room}) ignored: already joined");
            return Ok(JoinStatus::AlreadyJoined);
        }
        if session.outgoing.is_none() {
            log::debug!("join({room}) queued until connected");
            return Ok(JoinStatus::Queued);
        }

        match session.enqueue(&OutboundEvent::join(room)) {
            Ok(()) => {
                rooms.mark_sent(room);
                Ok(JoinStatus::Sent)
            }
            // The link is going away; the join is replayed on reconnect.
            Err(ChannelError::OutboxClosed) => Ok(JoinStatus::Queued),
            Err(e) => {
                rooms.request_leave(room);
                Err(e)
            }
        }
    }

    /// Leave `room`. Local membership clears immediately.
    pub async fn leave(&self, room: &str) -> Result<LeaveStatus, ChannelError> {
        let session = self.shared.session.lock().await;
        let action = self.shared.rooms.lock().await.request_leave(room);
        if action == LeaveAction::NotJoined {
            log::debug!("leave({room}) ignored: not joined");
            return Ok(LeaveStatus::NotJoined);
        }

        self.shared.typing.cancel(room);
        self.shared.remote_typing().forget(room);

        if action == LeaveAction::Dequeue {
            return Ok(LeaveStatus::Dequeued);
        }
        match session.enqueue(&OutboundEvent::leave(room)) {
            Ok(()) => Ok(LeaveStatus::Sent),
            // The server forgets our rooms with the transport anyway.
            Err(ChannelError::OutboxClosed | ChannelError::NotConnected) => Ok(LeaveStatus::Dequeued),
            Err(e) => Err(e),
        }
    }

    /// Rooms the user asked to be in, sorted.
    pub async fn joined_rooms(&self) -> Vec<String> {
        self.shared.rooms.lock().await.joined()
    }

    /// Rooms acknowledged by the server, sorted.
    pub async fn confirmed_rooms(&self) -> Vec<String> {
        self.shared.rooms.lock().await.confirmed()
    }

    /// Whether the user asked to be in `room` (confirmed or not).
    pub async fn is_joined(&self, room: &str) -> bool {
        self.shared.rooms.lock().await.is_joined(room)
    }

    /// Join `room` and return a view scoped to it.
    pub async fn open_room(&self, room: &str) -> Result<RoomView, ChannelError> {
        let events = self.subscribe();
        let status = self.join(room).await?;
        Ok(RoomView::new(self.clone(), room.to_string(), status, events))
    }

    // ── Messages ─────────────────────────────────────────────────

    /// Send a chat message. Fails with `NotConnected` unless connected.
    ///
    /// The message is not echoed into the local stream; use
    /// [`record_local`](Self::record_local) for optimistic display.
    pub async fn send(
        &self,
        room: &str,
        content: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<(), ChannelError> {
        let session = self.shared.session.lock().await;
        if self.state() != ConnectionState::Connected {
            return Err(ChannelError::NotConnected);
        }
        session.enqueue(&OutboundEvent::message(room, content, metadata))
    }

    /// Append a locally authored message to the stream.
    pub async fn record_local(&self, message: ChatMessage) {
        self.shared.messages.write().await.push(message);
    }

    /// Snapshot of the stream in arrival order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.shared.messages.read().await.entries().to_vec()
    }

    /// Snapshot of one room's messages in arrival order.
    pub async fn messages_for(&self, room: &str) -> Vec<ChatMessage> {
        self.shared.messages.read().await.for_session(room).cloned().collect()
    }

    /// Empty the local stream. Server-side history is untouched.
    pub async fn clear_messages(&self) {
        self.shared.messages.write().await.clear();
    }

    /// Drop one room's messages. Returns how many were removed.
    pub async fn clear_session(&self, room: &str) -> usize {
        self.shared.messages.write().await.clear_session(room)
    }

    // ── Typing ───────────────────────────────────────────────────

    /// A local keystroke in `room`.
    ///
    /// The first keystroke queues `typing` before returning, so it always
    /// precedes anything the caller sends afterwards. Nothing goes out for a
    /// room that is not joined or while not connected.
    pub async fn notify_typing(&self, room: &str) {
        let session = self.shared.session.lock().await;
        if let Some(signal) = self.shared.typing.notify_typing(room) {
            self.shared.send_typing(&session, signal).await;
        }
    }

    /// Local typing stopped (message sent, input cleared). Returns `false`
    /// and sends nothing when `room` was not typing.
    pub async fn notify_stop_typing(&self, room: &str) -> bool {
        let session = self.shared.session.lock().await;
        match self.shared.typing.notify_stop_typing(room) {
            Some(signal) => {
                self.shared.send_typing(&session, signal).await;
                true
            }
            None => false,
        }
    }

    /// Discard the local countdown for `room` without signalling.
    pub fn cancel_typing(&self, room: &str) -> bool {
        self.shared.typing.cancel(room)
    }

    /// Whether the local user is typing in `room`.
    pub fn is_typing(&self, room: &str) -> bool {
        self.shared.typing.is_typing(room)
    }

    /// Whether another participant is typing in `room`.
    pub fn is_remote_typing(&self, room: &str) -> bool {
        self.shared.remote_typing().is_typing(room, Instant::now())
    }

    /// Who is typing in `room`, if the server said.
    pub fn remote_typist(&self, room: &str) -> Option<String> {
        self.shared
            .remote_typing()
            .typist(room, Instant::now())
            .map(str::to_string)
    }

    // ── Notifications ────────────────────────────────────────────

    /// In-app notification state and native delivery.
    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.shared.notifications
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        // Err only means nobody is subscribed.
        let _ = self.events_tx.send(event);
    }

    /// Apply `trigger` to the state machine; invalid transitions are logged
    /// and leave the state untouched.
    fn transition(&self, trigger: Trigger) -> Option<ConnectionState> {
        let mut changed = None;
        self.state_tx.send_if_modified(|state| match state.next(trigger) {
            Some(next) if next != *state => {
                *state = next;
                changed = Some(next);
                true
            }
            Some(_) => false,
            None => {
                log::warn!("Rejected transition {trigger:?} from {state}");
                false
            }
        });
        if let Some(next) = changed {
            log::info!("Connection {next}");
            self.emit(ChannelEvent::State(next));
        }
        changed
    }

    fn bump_generation(&self, session: &mut Session) -> u64 {
        session.generation += 1;
        session.generation
    }

    /// The session, only if `generation` is still current.
    async fn current_session(&self, generation: u64) -> Option<MutexGuard<'_, Session>> {
        let session = self.session.lock().await;
        (session.generation == generation).then_some(session)
    }

    fn remote_typing(&self) -> StdMutexGuard<'_, RemoteTyping> {
        self.remote_typing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn teardown(&self, session: &mut Session) {
        self.bump_generation(session);
        if let Some(driver) = session.driver.take() {
            driver.abort();
        }
        session.outgoing = None;
        session.credential = None;

        let released = self.rooms.lock().await.clear();
        self.typing.cancel_all();
        self.remote_typing().clear();
        if self.transition(Trigger::Disconnect).is_some() {
            log::info!("Released {released} room(s)");
        }
    }

    // ── Driver callbacks ─────────────────────────────────────────

    async fn on_established(&self, generation: u64, outgoing: mpsc::Sender<String>, reconnected: bool) -> bool {
        let Some(mut session) = self.current_session(generation).await else {
            return false;
        };
        session.outgoing = Some(outgoing);
        self.transition(Trigger::Established);
        if reconnected {
            self.emit(ChannelEvent::Transport(TransportEvent::Reconnected));
        }

        let pending = self.rooms.lock().await.pending_joins();
        if !pending.is_empty() {
            log::info!("Joining {} queued room(s)", pending.len());
        }
        for room in pending {
            if let Err(e) = session.enqueue(&OutboundEvent::join(room.as_str())) {
                log::warn!("Replaying join for {room} failed: {e}");
            }
        }
        true
    }

    async fn on_transport_drop(&self, generation: u64) -> bool {
        let Some(mut session) = self.current_session(generation).await else {
            return false;
        };
        session.outgoing = None;
        self.rooms.lock().await.on_transport_drop();
        self.remote_typing().clear();
        log::warn!("Transport dropped");
        self.transition(Trigger::TransportDrop);
        true
    }

    async fn on_connect_failed(&self, generation: u64) {
        if self.current_session(generation).await.is_some() {
            self.transition(Trigger::Failed);
        }
    }

    async fn on_reconnect_attempt(&self, generation: u64, attempt: u32) -> bool {
        if self.current_session(generation).await.is_none() {
            return false;
        }
        log::info!("Reconnect attempt {attempt}");
        self.emit(ChannelEvent::Transport(TransportEvent::ReconnectAttempt { attempt }));
        true
    }

    async fn on_reconnect_error(&self, generation: u64, attempt: u32, error: String) -> bool {
        if self.current_session(generation).await.is_none() {
            return false;
        }
        log::warn!("Reconnect attempt {attempt} failed: {error}");
        self.emit(ChannelEvent::Transport(TransportEvent::ReconnectError { attempt, error }));
        true
    }

    async fn on_exhausted(&self, generation: u64) {
        let Some(mut session) = self.current_session(generation).await else {
            return;
        };
        session.driver = None;
        self.transition(Trigger::Exhausted);
        self.emit(ChannelEvent::Transport(TransportEvent::ReconnectFailed));
    }

    // ── Inbound dispatch ─────────────────────────────────────────

    async fn dispatch_frame(&self, generation: u64, frame: &str) {
        let event = match InboundEvent::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };
        // Held while the event is applied: `disconnect()` and `logout()`
        // bump the generation under this lock, so nothing from an old
        // connection lands after they cleared local state.
        let Some(_session) = self.current_session(generation).await else {
            return;
        };
        log::trace!("Inbound {}", event.name());

        match event {
            InboundEvent::Message(message) => self.on_message(message).await,
            InboundEvent::Typing(payload) => self.on_remote_typing(payload),
            InboundEvent::StopTyping(payload) => self.on_remote_stop_typing(payload),
            InboundEvent::ChatError(payload) => self.on_chat_error(payload),
            InboundEvent::RoomJoined(room) => self.on_room_joined(room).await,
            InboundEvent::RoomLeft(room) => self.on_room_left(room).await,
            InboundEvent::Notification(notification) => self.on_notification(notification).await,
            InboundEvent::NotificationRead(reference) => self.on_notification_read(reference).await,
            InboundEvent::NotificationUpdate(notification) => {
                self.on_notification_update(notification).await
            }
        }
    }

    async fn on_message(&self, message: ChatMessage) {
        self.messages.write().await.push(message.clone());
        self.emit(ChannelEvent::Message(message));
    }

    fn on_remote_typing(&self, payload: TypingPayload) {
        self.remote_typing()
            .mark_typing(&payload.session_id, payload.user_id.clone(), Instant::now());
        self.emit(ChannelEvent::Typing {
            session_id: payload.session_id,
            user_id: payload.user_id,
            typing: true,
        });
    }

    fn on_remote_stop_typing(&self, payload: TypingPayload) {
        let was_typing = self
            .remote_typing()
            .mark_stopped(&payload.session_id, Instant::now());
        if was_typing {
            self.emit(ChannelEvent::Typing {
                session_id: payload.session_id,
                user_id: payload.user_id,
                typing: false,
            });
        }
    }

    fn on_chat_error(&self, payload: ChatErrorPayload) {
        log::warn!(
            "Server reported chat error{}: {}",
            payload.session_id.as_deref().map(|s| format!(" in {s}")).unwrap_or_default(),
            payload.message
        );
        self.emit(ChannelEvent::ChatError(payload));
    }

    async fn on_room_joined(&self, room: RoomRef) {
        if self.rooms.lock().await.confirm_joined(&room.session_id) {
            self.emit(ChannelEvent::RoomJoined(room.session_id));
        } else {
            log::debug!("Ignoring room_joined for {}: no longer wanted", room.session_id);
        }
    }

    async fn on_room_left(&self, room: RoomRef) {
        self.rooms.lock().await.confirm_left(&room.session_id);
        self.emit(ChannelEvent::RoomLeft(room.session_id));
    }

    async fn on_notification(&self, notification: Notification) {
        let delivery = self.notifications.receive(notification.clone()).await;
        log::debug!("Notification {}: {:?}", notification.id, delivery);
        self.emit(ChannelEvent::Notification(notification));
    }

    async fn on_notification_read(&self, reference: NotificationRef) {
        self.notifications.mark_as_read(&reference.id).await;
        self.emit(ChannelEvent::NotificationRead(reference.id));
    }

    async fn on_notification_update(&self, notification: Notification) {
        self.notifications.apply_update(notification.clone()).await;
        self.emit(ChannelEvent::NotificationUpdated(notification));
    }

    /// Countdown expiry from the debouncer.
    async fn forward_expired(&self, signal: TypingSignal) {
        let session = self.session.lock().await;
        // A keystroke after the expiry already sent a fresh `typing`.
        if self.typing.is_typing(signal.room()) {
            log::trace!("Stale typing expiry for {} dropped", signal.room());
            return;
        }
        self.send_typing(&session, signal).await;
    }

    /// Queue a typing frame. Callers hold the session lock so frames keep
    /// call order relative to joins, leaves and messages.
    async fn send_typing(&self, session: &Session, signal: TypingSignal) {
        if session.outgoing.is_none() {
            log::trace!("Typing signal for {} dropped while offline", signal.room());
            return;
        }
        if !self.rooms.lock().await.is_joined(signal.room()) {
            log::trace!("Typing signal for {} dropped: room not joined", signal.room());
            return;
        }
        let event = match &signal {
            TypingSignal::Started(room) => OutboundEvent::Typing(RoomRef::new(room.as_str())),
            TypingSignal::Stopped(room) => OutboundEvent::StopTyping(RoomRef::new(room.as_str())),
        };
        if let Err(e) = session.enqueue(&event) {
            log::debug!("Typing signal for {} not sent: {e}", signal.room());
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(driver) = self.session.get_mut().driver.take() {
            driver.abort();
        }
    }
}

fn spawn_typing_forwarder(shared: Weak<Shared>, mut expired: mpsc::UnboundedReceiver<TypingSignal>) {
    tokio::spawn(async move {
        while let Some(signal) = expired.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.forward_expired(signal).await;
        }
    });
}

/// Connection driver for one generation.
///
/// Holds only a weak reference between steps so dropping the last channel
/// handle ends the connection.
async fn drive(
    shared: Weak<Shared>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    generation: u64,
    credential: Credential,
) {
    let mut link = match connector.connect(&credential).await {
        Ok(link) => link,
        Err(e) => {
            log::warn!("Connection failed: {e}");
            if let Some(shared) = shared.upgrade() {
                shared.on_connect_failed(generation).await;
            }
            return;
        }
    };

    let mut reconnected = false;
    loop {
        let Link { outgoing, mut incoming } = link;
        {
            let Some(s) = shared.upgrade() else {
                return;
            };
            if !s.on_established(generation, outgoing, reconnected).await {
                return;
            }
        }

        while let Some(frame) = incoming.recv().await {
            let Some(s) = shared.upgrade() else {
                return;
            };
            s.dispatch_frame(generation, &frame).await;
        }

        {
            let Some(s) = shared.upgrade() else {
                return;
            };
            if !s.on_transport_drop(generation).await {
                return;
            }
        }

        link = match reconnect(&shared, connector.as_ref(), &policy, generation, &credential).await {
            Some(link) => link,
            None => return,
        };
        reconnected = true;
    }
}

/// Retry with exponential backoff until a link opens, the budget runs out,
/// or the generation goes stale.
async fn reconnect(
    shared: &Weak<Shared>,
    connector: &dyn Connector,
    policy: &ReconnectPolicy,
    generation: u64,
    credential: &Credential,
) -> Option<Link> {
    let mut failures = 0u32;
    loop {
        if policy.is_exhausted(failures) {
            if let Some(s) = shared.upgrade() {
                s.on_exhausted(generation).await;
            }
            return None;
        }

        tokio::time::sleep(policy.delay_for(failures)).await;
        let attempt = failures + 1;
        if !shared.upgrade()?.on_reconnect_attempt(generation, attempt).await {
            return None;
        }

        match connector.connect(credential).await {
            Ok(link) => return Some(link),
            Err(e) => {
                if !shared
                    .upgrade()?
                    .on_reconnect_error(generation, attempt, e.to_string())
                    .await
                {
                    return None;
                }
                failures += 1;
            }
        }
    }
}
