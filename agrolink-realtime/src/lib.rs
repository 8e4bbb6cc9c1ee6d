//! # agrolink-realtime: Realtime session channel for AgroLink
//!
//! One persistent WebSocket per signed-in user carries chat messages, typing
//! indicators and push notifications between the advisory front end and its
//! backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐      WebSocket       ┌──────────────┐
//! │ RealtimeChannel  │ ◄──────────────────► │ RelayServer  │
//! │ (one per user)   │  {"event","data"}    │ (fan-out)    │
//! └───┬──────┬───────┘                      └──────┬───────┘
//!     │      │                                     │
//!     ▼      ▼                              ┌──────┴───────┐
//! RoomView  NotificationDispatcher          │ RoomManager  │
//! (screen)  (in-app + native)               │ BroadcastGroup│
//!                                           └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events (`join_room`, `message`, `notification`, …)
//! - [`transport`]: `Connector` seam and the WebSocket connector
//! - [`connection`]: Connection state machine and reconnect backoff
//! - [`rooms`]: Two-phase room membership (intent / confirmed)
//! - [`typing`]: Typing debouncer and remote typing state
//! - [`messages`]: Append-only message stream
//! - [`notifications`]: Notification center and native delivery
//! - [`channel`]: The realtime channel tying it all together
//! - [`view`]: Per-screen room handle
//! - [`broadcast`] / [`server`]: Relay used for development and tests
//!
//! ## Example
//!
//! ```no_run
//! use agrolink_realtime::{ChannelConfig, ChannelEvent, RealtimeChannel};
//!
//! # async fn demo() -> Result<(), agrolink_realtime::ChannelError> {
//! let channel = RealtimeChannel::with_websocket(ChannelConfig::with_url("ws://127.0.0.1:5000"));
//! channel.connect("token").await?;
//!
//! let mut room = channel.open_room("session-42").await?;
//! room.typing().await;
//! room.send("When should I sow wheat?", Default::default()).await?;
//! loop {
//!     match room.next_event().await {
//!         Some(ChannelEvent::Message(reply)) => println!("{}", reply.content),
//!         Some(_) => continue,
//!         None => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod protocol;
pub mod error;
pub mod config;
pub mod connection;
pub mod transport;
pub mod rooms;
pub mod typing;
pub mod messages;
pub mod notifications;
pub mod channel;
pub mod view;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    ChatErrorPayload, ChatMessage, InboundEvent, MessageId, Notification, NotificationRef,
    OutboundEvent, OutgoingMessage, Priority, RoomRef, SenderRole, Timestamp, TypingPayload,
};
pub use error::{ChannelError, ConfigError, NotifierError, ProtocolError, TransportError};
pub use config::{ChannelConfig, NotificationConfig};
pub use connection::{ConnectionState, ReconnectPolicy, TransportEvent, Trigger};
pub use transport::{Connector, Credential, Link, LinkPeer, WsConnector};
pub use rooms::{JoinStatus, LeaveStatus, RoomTracker};
pub use typing::{RemoteTyping, TypingDebouncer, TypingSignal};
pub use messages::MessageStream;
pub use notifications::{
    Delivery, HeadlessNotifier, NativeNotifier, NativeOutcome, NativeToast, NotificationCenter,
    NotificationDispatcher, Permission, Upsert,
};
pub use channel::{ChannelEvent, RealtimeChannel};
pub use view::RoomView;
pub use broadcast::{BroadcastGroup, BroadcastStats, RelayFrame, RoomManager};
pub use server::{RelayConfig, RelayHandle, RelayServer, RelayStats};
