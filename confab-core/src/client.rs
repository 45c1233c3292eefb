//! Participant side of the hub connection.
//!
//! [`connect`] performs the WebSocket handshake, registers with the hub and
//! hands back a writer/reader pair for use in `tokio::select!` loops.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::{ConfabError, ConfabResult};
use crate::models::ParticipantKind;
use crate::protocol::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Who this client registers as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub kind: ParticipantKind,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ParticipantKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            host: None,
            port: None,
        }
    }

    pub fn with_address(mut self, host: Option<String>, port: Option<u16>) -> Self {
        self.host = host;
        self.port = port.filter(|p| *p != 0);
        self
    }

    fn connect_frame(&self) -> Frame {
        Frame::connect(
            self.id.clone(),
            self.name.clone(),
            self.kind,
            self.host.clone(),
            self.port,
        )
    }
}

pub struct ChatWriter {
    sink: SplitSink<WsStream, WsMessage>,
    identity: Identity,
    send_timeout: Duration,
}

impl ChatWriter {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn send(&mut self, frame: &Frame) -> ConfabResult<()> {
        let text = frame.encode()?;
        match tokio::time::timeout(self.send_timeout, self.sink.send(WsMessage::Text(text))).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConfabError::SendTimeout(self.send_timeout)),
        }
    }

    /// Sends a chat line as this participant.
    pub async fn say(&mut self, text: impl Into<String>) -> ConfabResult<()> {
        let frame = Frame::chat(self.identity.id.clone(), self.identity.kind, text);
        self.send(&frame).await
    }

    pub async fn pong(&mut self) -> ConfabResult<()> {
        self.send(&Frame::Pong).await
    }

    /// Announces the departure and closes the socket.
    pub async fn disconnect(mut self) -> ConfabResult<()> {
        let frame = Frame::disconnect(self.identity.id.clone());
        let sent = self.send(&frame).await;
        let _ = tokio::time::timeout(self.send_timeout, self.sink.close()).await;
        sent
    }
}

pub struct ChatReader {
    stream: SplitStream<WsStream>,
}

impl ChatReader {
    /// Next decoded frame. `None` once the hub closes the connection;
    /// undecodable frames surface as protocol errors and reading can
    /// continue.
    pub async fn next_frame(&mut self) -> Option<ConfabResult<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };

            match message {
                WsMessage::Text(text) => return Some(Frame::decode(&text)),
                WsMessage::Binary(bytes) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|_| ConfabError::MalformedFrame("binary frame is not UTF-8".to_string()))
                            .and_then(|text| Frame::decode(&text)),
                    )
                }
                WsMessage::Close(frame) => {
                    debug!(?frame, "Hub closed the connection");
                    return None;
                }
                _ => continue,
            }
        }
    }
}

/// Connects to `url` and registers `identity`. The handshake is bounded by
/// `send_timeout`.
pub async fn connect(
    url: &str,
    identity: Identity,
    send_timeout: Duration,
) -> ConfabResult<(ChatWriter, ChatReader)> {
    let handshake = tokio::time::timeout(send_timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| ConfabError::ConnectionFailed {
            url: url.to_string(),
            message: format!("handshake timed out after {:?}", send_timeout),
        })?;
    let (ws, _response) = handshake.map_err(|e| ConfabError::ConnectionFailed {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let (sink, stream) = ws.split();
    let mut writer = ChatWriter {
        sink,
        identity,
        send_timeout,
    };

    let connect = writer.identity.connect_frame();
    writer.send(&connect).await?;

    info!(
        url = %url,
        participant_id = %writer.identity.id,
        kind = %writer.identity.kind,
        "Connected to hub"
    );

    Ok((writer, ChatReader { stream }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_connect_frame() {
        let identity = Identity::new("a1", "Ada", ParticipantKind::Agent)
            .with_address(Some("127.0.0.1".to_string()), Some(0));

        match identity.connect_frame() {
            Frame::Connect(c) => {
                assert_eq!(c.id, "a1");
                assert_eq!(c.kind, ParticipantKind::Agent);
                assert_eq!(c.port, None);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect(
            "not-a-url",
            Identity::new("a", "A", ParticipantKind::Human),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ConfabError::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect(
            "ws://127.0.0.1:1/",
            Identity::new("a", "A", ParticipantKind::Human),
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out_on_silent_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            // hold the socket open without ever answering the upgrade
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let started = std::time::Instant::now();
        let result = connect(
            &format!("ws://{}/", addr),
            Identity::new("a", "A", ParticipantKind::Human),
            Duration::from_millis(200),
        )
        .await;

        match result {
            Err(ConfabError::ConnectionFailed { message, .. }) => {
                assert!(message.contains("timed out"), "got {}", message);
            }
            other => panic!("expected handshake timeout, got {:?}", other.map(|_| ())),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        accept.abort();
    }
}
