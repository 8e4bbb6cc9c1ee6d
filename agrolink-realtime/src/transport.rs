//! Transport seam between the channel and the network.
//!
//! A [`Connector`] turns a [`Credential`] into a [`Link`]: a pair of frame
//! channels. The channel never touches sockets directly, so tests can hand
//! it in-memory links from [`Link::pair`].
//!
//! [`WsConnector`] is the production connector: one WebSocket with the
//! credential sent as `Authorization: Bearer <token>`, pumped by a writer
//! task and a reader task.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// Bearer credential identifying the authenticated user.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Value of the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl From<&str> for Credential {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for Credential {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// An open connection, seen as two frame channels.
///
/// The link is considered dropped once `incoming` yields `None`.
/// Dropping `outgoing` closes the connection.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

/// The far end of an in-memory [`Link`].
#[derive(Debug)]
pub struct LinkPeer {
    /// Frames the client sent.
    pub received: mpsc::Receiver<String>,
    /// Frames to deliver to the client. Drop to simulate a transport drop.
    pub deliver: mpsc::Sender<String>,
}

impl Link {
    /// Create a connected in-memory link and its far end.
    pub fn pair(capacity: usize) -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Link { outgoing: out_tx, incoming: in_rx },
            LinkPeer { received: out_rx, deliver: in_tx },
        )
    }
}

/// Opens links for the channel.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, credential: &Credential) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    capacity: usize,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, capacity: usize) -> Self {
        Self {
            url: url.into(),
            capacity: capacity.max(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self, credential: &Credential) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = self.url.clone();
        let capacity = self.capacity;
        let bearer = credential.bearer();

        Box::pin(async move {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| TransportError::InvalidUrl {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
            let header =
                HeaderValue::from_str(&bearer).map_err(|_| TransportError::InvalidCredential)?;
            request.headers_mut().insert(AUTHORIZATION, header);

            let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<String>(capacity);
            let (in_tx, in_rx) = mpsc::channel::<String>(capacity);

            // Writer task: forward outgoing frames; close the socket once the
            // channel side drops its sender.
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: forward text frames until the socket closes.
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    let frame = match msg {
                        Ok(Message::Text(text)) => text.as_str().to_owned(),
                        Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                log::warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len());
                                continue;
                            }
                        },
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            log::debug!("WebSocket read error: {e}");
                            break;
                        }
                        Ok(_) => continue,
                    };
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });

            Ok(Link { outgoing: out_tx, incoming: in_rx })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacted() {
        let credential = Credential::new("secret-token");
        assert_eq!(format!("{credential:?}"), "Credential(***)");
        assert_eq!(credential.bearer(), "Bearer secret-token");
    }

    #[test]
    fn test_credential_empty() {
        assert!(Credential::new("   ").is_empty());
        assert!(!Credential::from("tok1").is_empty());
    }

    #[tokio::test]
    async fn test_link_pair_carries_frames_both_ways() {
        let (mut link, mut peer) = Link::pair(4);

        link.outgoing.send("up".into()).await.unwrap();
        assert_eq!(peer.received.recv().await.as_deref(), Some("up"));

        peer.deliver.send("down".into()).await.unwrap();
        assert_eq!(link.incoming.recv().await.as_deref(), Some("down"));

        drop(peer);
        assert!(link.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ws_connector_invalid_url() {
        let connector = WsConnector::new("not a url", 8);
        let err = connector.connect(&Credential::new("tok")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_ws_connector_rejects_header_breaking_credential() {
        let connector = WsConnector::new("ws://127.0.0.1:1/realtime", 8);
        let err = connector.connect(&Credential::new("bad\ntoken")).await.unwrap_err();
        assert_eq!(err, TransportError::InvalidCredential);
    }

    #[tokio::test]
    async fn test_ws_connector_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WsConnector::new(format!("ws://127.0.0.1:{port}"), 8);
        let err = connector.connect(&Credential::new("tok")).await.unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_)));
    }
}
