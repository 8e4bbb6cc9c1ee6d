//! Per-screen room handle.

use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::channel::{ChannelEvent, RealtimeChannel};
use crate::error::ChannelError;
use crate::protocol::ChatMessage;
use crate::rooms::{JoinStatus, LeaveStatus};

/// A joined room as seen by one screen.
///
/// Created by [`RealtimeChannel::open_room`]. Closing or dropping the view
/// cancels the local typing countdown, leaves the room and detaches the
/// subscription. [`close`](RoomView::close) reports how the leave went;
/// dropping leaves from a spawned task.
pub struct RoomView {
    channel: RealtimeChannel,
    room: String,
    join_status: JoinStatus,
    events: broadcast::Receiver<ChannelEvent>,
    closed: bool,
}

impl RoomView {
    pub(crate) fn new(
        channel: RealtimeChannel,
        room: String,
        join_status: JoinStatus,
        events: broadcast::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            channel,
            room,
            join_status,
            events,
            closed: false,
        }
    }

    /// Room this view is scoped to.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// How the join behind this view went out.
    pub fn join_status(&self) -> JoinStatus {
        self.join_status
    }

    /// A keystroke in this room.
    pub async fn typing(&self) {
        self.channel.notify_typing(&self.room).await;
    }

    /// Stop typing in this room. Returns `false` if not typing.
    pub async fn stop_typing(&self) -> bool {
        self.channel.notify_stop_typing(&self.room).await
    }

    /// Stop typing and send a message to this room.
    pub async fn send(&self, content: impl Into<String>, metadata: Map<String, Value>) -> Result<(), ChannelError> {
        self.stop_typing().await;
        self.channel.send(&self.room, content, metadata).await
    }

    /// This room's messages in arrival order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.channel.messages_for(&self.room).await
    }

    /// Whether another participant is typing here.
    pub fn is_remote_typing(&self) -> bool {
        self.channel.is_remote_typing(&self.room)
    }

    /// Next event scoped to this room. `None` once the channel is gone.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.session_id() == Some(self.room.as_str()) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Room view {} lagged; {skipped} event(s) skipped", self.room);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Cancel typing, leave the room and drop the subscription.
    pub async fn close(mut self) -> Result<LeaveStatus, ChannelError> {
        self.closed = true;
        self.channel.cancel_typing(&self.room);
        self.channel.leave(&self.room).await
    }
}

impl Drop for RoomView {
    fn drop(&mut self) {
        self.channel.cancel_typing(&self.room);
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("Room view {} dropped outside a runtime; room stays joined", self.room);
            return;
        };
        let channel = self.channel.clone();
        let room = std::mem::take(&mut self.room);
        runtime.spawn(async move {
            if let Err(e) = channel.leave(&room).await {
                log::warn!("Leaving {room} after its view was dropped failed: {e}");
            }
        });
    }
}

impl std::fmt::Debug for RoomView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomView")
            .field("room", &self.room)
            .field("join_status", &self.join_status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::connection::ConnectionState;
    use crate::notifications::HeadlessNotifier;
    use crate::transport::{Connector, Credential, Link, LinkPeer};
    use crate::error::TransportError;
    use futures_util::future::BoxFuture;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct OneLink(Mutex<Option<Link>>);

    impl Connector for OneLink {
        fn connect(&self, _credential: &Credential) -> BoxFuture<'static, Result<Link, TransportError>> {
            let link = self.0.lock().unwrap().take().ok_or(TransportError::Closed);
            Box::pin(async move { link })
        }
    }

    async fn connected() -> (RealtimeChannel, LinkPeer) {
        let (link, peer) = Link::pair(64);
        let channel = RealtimeChannel::new(
            ChannelConfig::default(),
            Arc::new(OneLink(Mutex::new(Some(link)))),
            Arc::new(HeadlessNotifier::default()),
        );
        channel.connect("tok1").await.unwrap();
        channel.wait_for_state(ConnectionState::Connected).await;
        (channel, peer)
    }

    async fn next_frame(peer: &mut LinkPeer) -> serde_json::Value {
        serde_json::from_str(&peer.received.recv().await.unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_filters_events_by_room() {
        let (channel, peer) = connected().await;
        let mut view = channel.open_room("room-7").await.unwrap();
        assert_eq!(view.join_status(), JoinStatus::Sent);

        for (session, content) in [("other", "not mine"), ("room-7", "mine")] {
            let frame = json!({"event": "message", "data": {"sessionId": session, "content": content}});
            peer.deliver.send(frame.to_string()).await.unwrap();
        }

        match view.next_event().await {
            Some(ChannelEvent::Message(m)) => assert_eq!(m.content, "mine"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(view.messages().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_send_stops_typing() {
        let (channel, mut peer) = connected().await;
        let view = channel.open_room("room-7").await.unwrap();
        assert_eq!(next_frame(&mut peer).await["event"], "join_room");

        view.typing().await;
        assert!(channel.is_typing("room-7"));
        view.send("Is urea safe now?", Map::new()).await.unwrap();
        assert!(!channel.is_typing("room-7"));

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(next_frame(&mut peer).await["event"].as_str().unwrap().to_string());
        }
        assert_eq!(events, vec!["typing", "stop_typing", "send_message"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_typing_and_leaves() {
        let (channel, mut peer) = connected().await;
        let view = channel.open_room("room-7").await.unwrap();
        next_frame(&mut peer).await;

        view.typing().await;
        assert_eq!(next_frame(&mut peer).await["event"], "typing");
        assert_eq!(view.close().await.unwrap(), LeaveStatus::Sent);
        assert_eq!(
            next_frame(&mut peer).await,
            json!({"event": "leave_room", "data": {"sessionId": "room-7"}})
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(peer.received.try_recv().is_err());
        assert!(!channel.is_joined("room-7").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_right_after_typing_sends_typing_first() {
        let (channel, mut peer) = connected().await;
        let view = channel.open_room("room-7").await.unwrap();

        view.typing().await;
        view.close().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut events = Vec::new();
        while let Ok(frame) = peer.received.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            events.push(value["event"].as_str().unwrap().to_string());
        }
        assert_eq!(events, vec!["join_room", "typing", "leave_room"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_countdown_and_leaves() {
        let (channel, mut peer) = connected().await;
        let view = channel.open_room("room-7").await.unwrap();
        next_frame(&mut peer).await;

        view.typing().await;
        next_frame(&mut peer).await;
        drop(view);

        assert_eq!(
            next_frame(&mut peer).await,
            json!({"event": "leave_room", "data": {"sessionId": "room-7"}})
        );
        assert!(!channel.is_joined("room-7").await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_view_does_not_leave_twice() {
        let (channel, mut peer) = connected().await;
        let view = channel.open_room("room-7").await.unwrap();
        next_frame(&mut peer).await;
        view.close().await.unwrap();
        next_frame(&mut peer).await;

        let reopened = channel.open_room("room-7").await.unwrap();
        assert_eq!(reopened.join_status(), JoinStatus::Sent);
        next_frame(&mut peer).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(peer.received.try_recv().is_err());
        assert!(channel.is_joined("room-7").await);
    }
}
