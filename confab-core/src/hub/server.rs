use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::transcript::DynTranscriptSink;
use super::Hub;
use crate::config::HubConfig;
use crate::error::{ConfabError, ConfabResult};
use crate::models::{ConnectionHandle, Message, Participant, ParticipantKind, SYSTEM_SENDER_ID};
use crate::protocol::{ChatFrame, ConnectFrame, Frame};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Per-connection timing and queue limits.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
    pub outbound_queue_size: usize,
}

impl From<&HubConfig> for ConnectionSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
            send_timeout: config.send_timeout(),
            outbound_queue_size: config.outbound_queue_size.max(1),
        }
    }
}

pub struct HubServer {
    listener: TcpListener,
    hub: Arc<Hub>,
    settings: ConnectionSettings,
}

impl HubServer {
    /// Binds the listening socket. Failure here is fatal for the process.
    pub async fn bind(config: &HubConfig, sink: DynTranscriptSink) -> ConfabResult<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ConfabError::BindFailed {
                addr: addr.clone(),
                message: e.to_string(),
            })?;

        info!(addr = %addr, "Hub listening");

        Ok(Self {
            listener,
            hub: Hub::new(sink, config.delivery_timeout()),
            settings: ConnectionSettings::from(config),
        })
    }

    pub fn local_addr(&self) -> ConfabResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub async fn serve(self) -> ConfabResult<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes, then tears down every
    /// open connection.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> ConfabResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut connections = JoinSet::new();
        let mut next_connection_id: u64 = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(open = connections.len(), "Hub shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_connection_id += 1;
                        let connection = Connection::new(
                            next_connection_id,
                            peer,
                            self.hub.clone(),
                            self.settings.clone(),
                        );
                        connections.spawn(connection.run(stream));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionState {
    Connected,
    Registered {
        id: String,
        name: String,
        kind: ParticipantKind,
    },
    Closed,
}

/// Unregisters and stops the writer however the reader loop exits.
struct CleanupGuard {
    hub: Arc<Hub>,
    connection_id: u64,
    registered_id: Option<String>,
    writer: Option<JoinHandle<()>>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }

        if let Some(id) = self.registered_id.take() {
            let hub = self.hub.clone();
            let connection_id = self.connection_id;
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    hub.unregister_connection(&id, connection_id).await;
                });
            }
        }
    }
}

struct Connection {
    id: u64,
    peer: SocketAddr,
    hub: Arc<Hub>,
    settings: ConnectionSettings,
    state: ConnectionState,
}

impl Connection {
    fn new(id: u64, peer: SocketAddr, hub: Arc<Hub>, settings: ConnectionSettings) -> Self {
        Self {
            id,
            peer,
            hub,
            settings,
            state: ConnectionState::Connected,
        }
    }

    async fn run(mut self, stream: TcpStream) {
        let ws = match timeout(self.settings.send_timeout, accept_async(stream)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                debug!(peer = %self.peer, error = %e, "WebSocket handshake failed");
                return;
            }
            Err(_) => {
                debug!(peer = %self.peer, "WebSocket handshake timed out");
                return;
            }
        };

        debug!(peer = %self.peer, connection = self.id, "Connection opened");

        let (sink, mut source) = ws.split();
        let (tx, rx) = mpsc::channel(self.settings.outbound_queue_size);
        let handle = ConnectionHandle::new(self.id, tx);

        let writer = tokio::spawn(run_writer(
            sink,
            rx,
            handle.clone(),
            self.settings.heartbeat_interval,
            self.settings.send_timeout,
        ));

        let mut guard = CleanupGuard {
            hub: self.hub.clone(),
            connection_id: self.id,
            registered_id: None,
            writer: Some(writer),
        };

        self.read_loop(&mut source, &handle, &mut guard).await;
        self.state = ConnectionState::Closed;

        debug!(peer = %self.peer, connection = self.id, "Connection closed");
    }

    async fn read_loop(
        &mut self,
        source: &mut WsSource,
        handle: &ConnectionHandle,
        guard: &mut CleanupGuard,
    ) {
        loop {
            let next = tokio::select! {
                _ = handle.close_requested() => {
                    debug!(connection = self.id, "Connection closed by hub");
                    return;
                }
                next = timeout(self.settings.idle_timeout, source.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    let who = self.participant_label();
                    ConfabError::PeerUnresponsive(who).log();
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!(connection = self.id, error = %e, "Transport error");
                    return;
                }
                Ok(Some(Ok(message))) => message,
            };

            let text = match message {
                WsMessage::Text(text) => text,
                WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        ConfabError::MalformedFrame("binary frame is not UTF-8".to_string()).log();
                        continue;
                    }
                },
                WsMessage::Close(_) => return,
                _ => continue,
            };

            match Frame::decode(&text) {
                Ok(frame) => {
                    self.handle_frame(frame, handle, guard).await;
                    if self.state == ConnectionState::Closed {
                        return;
                    }
                }
                Err(e) => e.log(),
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        handle: &ConnectionHandle,
        guard: &mut CleanupGuard,
    ) {
        let state = self.state.clone();
        match (state, frame) {
            (ConnectionState::Connected, Frame::Connect(connect)) => {
                self.register(connect, handle, guard).await;
            }
            (ConnectionState::Connected, other) => {
                ConfabError::NotRegistered(other.type_name().to_string()).log();
            }
            (ConnectionState::Registered { id, .. }, Frame::Connect(connect)) => {
                warn!(
                    participant_id = %id,
                    requested_id = %connect.id,
                    "Connection already registered; connect ignored"
                );
            }
            (ConnectionState::Registered { id, name, kind }, Frame::Message(chat)) => {
                let message = stamp(&id, &name, kind, chat);
                self.hub.route(&id, &message).await;
            }
            (ConnectionState::Registered { id, .. }, Frame::Command(command)) => {
                info!(
                    participant_id = %id,
                    command = %command.command,
                    "Command received; commands are not handled yet"
                );
            }
            (ConnectionState::Registered { id, .. }, Frame::Disconnect(disconnect)) => {
                if disconnect.id != id {
                    warn!(
                        participant_id = %id,
                        requested_id = %disconnect.id,
                        "Disconnect names another participant; closing own connection only"
                    );
                }
                info!(participant_id = %id, "Participant disconnected");
                self.state = ConnectionState::Closed;
            }
            (ConnectionState::Registered { .. }, Frame::Ping) => {
                if handle
                    .sender()
                    .send_timeout(Frame::Pong, self.settings.send_timeout)
                    .await
                    .is_err()
                {
                    debug!(connection = self.id, "Could not queue pong");
                }
            }
            (ConnectionState::Registered { .. }, Frame::Pong) => {
                debug!(connection = self.id, "Heartbeat acknowledged");
            }
            (ConnectionState::Closed, _) => {}
        }
    }

    async fn register(
        &mut self,
        connect: ConnectFrame,
        handle: &ConnectionHandle,
        guard: &mut CleanupGuard,
    ) {
        if let Err(e) = validate_connect(&connect) {
            e.log();
            return;
        }

        let name = if connect.name.trim().is_empty() {
            connect.id.clone()
        } else {
            connect.name.clone()
        };

        let participant =
            Participant::new(connect.id.clone(), name.clone(), connect.kind, handle.clone())
                .with_address(connect.host, connect.port);

        self.hub.register(participant).await;

        guard.registered_id = Some(connect.id.clone());
        self.state = ConnectionState::Registered {
            id: connect.id,
            name,
            kind: connect.kind,
        };
    }

    fn participant_label(&self) -> String {
        match &self.state {
            ConnectionState::Registered { id, .. } => id.clone(),
            _ => self.peer.to_string(),
        }
    }
}

/// Rejects registrations the hub must never accept: the `system` kind, an
/// empty id, or the id reserved for hub announcements.
fn validate_connect(connect: &ConnectFrame) -> ConfabResult<()> {
    if !connect.kind.is_connectable() {
        return Err(ConfabError::InvalidRegistration(format!(
            "kind '{}' cannot connect",
            connect.kind
        )));
    }

    let id = connect.id.trim();
    if id.is_empty() {
        return Err(ConfabError::InvalidRegistration(
            "empty participant id".to_string(),
        ));
    }
    if id.eq_ignore_ascii_case(SYSTEM_SENDER_ID) {
        return Err(ConfabError::InvalidRegistration(format!(
            "id '{}' is reserved for hub announcements",
            connect.id
        )));
    }

    Ok(())
}

/// Builds the routed message from a client's chat frame, overriding any
/// identity fields the client supplied.
fn stamp(id: &str, name: &str, kind: ParticipantKind, chat: ChatFrame) -> Message {
    if chat.from != id {
        warn!(
            participant_id = %id,
            claimed = %chat.from,
            "Message 'from' does not match registered id; overriding"
        );
    }
    Message::chat(id, name, kind, chat.message)
}

async fn run_writer(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Frame>,
    handle: ConnectionHandle,
    heartbeat_interval: Duration,
    send_timeout: Duration,
) {
    let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            next = rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
            _ = heartbeat.tick() => Frame::Ping,
        };

        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                continue;
            }
        };

        match timeout(send_timeout, sink.send(WsMessage::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = handle.connection_id, error = %e, "Write failed");
                break;
            }
            Err(_) => {
                ConfabError::SendTimeout(send_timeout).log();
                break;
            }
        }
    }

    handle.request_close();
    let _ = timeout(send_timeout, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_overrides_identity() {
        let chat = ChatFrame {
            from: "mallory".to_string(),
            origin: Some(ParticipantKind::System),
            message: "hello".to_string(),
            name: Some("system".to_string()),
            sent_at: None,
        };

        let message = stamp("a1", "Ada", ParticipantKind::Human, chat);
        assert_eq!(message.sender_id, "a1");
        assert_eq!(message.sender_name, "Ada");
        assert_eq!(message.origin, ParticipantKind::Human);
        assert_eq!(message.body, "hello");
    }

    fn connect_frame(id: &str, kind: ParticipantKind) -> ConnectFrame {
        ConnectFrame {
            name: "Someone".to_string(),
            id: id.to_string(),
            kind,
            host: None,
            port: None,
        }
    }

    #[test]
    fn test_validate_connect() {
        assert!(validate_connect(&connect_frame("a1", ParticipantKind::Human)).is_ok());
        assert!(validate_connect(&connect_frame("a1", ParticipantKind::Agent)).is_ok());

        for (id, kind) in [
            ("a1", ParticipantKind::System),
            ("  ", ParticipantKind::Human),
            ("system", ParticipantKind::Human),
            (" System ", ParticipantKind::Agent),
            ("SYSTEM", ParticipantKind::Human),
        ] {
            let err = validate_connect(&connect_frame(id, kind)).unwrap_err();
            assert!(
                matches!(err, ConfabError::InvalidRegistration(_)),
                "connect as {:?}/{:?} must be rejected",
                id,
                kind
            );
        }
    }

    #[tokio::test]
    async fn test_writer_gives_up_on_peer_that_stops_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let tcp = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = tokio_tungstenite::client_async(format!("ws://{}/", addr), tcp)
                .await
                .unwrap();
            // registered but never reads again
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(ws);
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (sink, _source) = accept_async(stream).await.unwrap().split();

        let (tx, rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(1, tx.clone());
        let writer = tokio::spawn(run_writer(
            sink,
            rx,
            handle.clone(),
            Duration::from_secs(60),
            Duration::from_millis(300),
        ));

        let filler = "x".repeat(256 * 1024);
        let feeder = tokio::spawn(async move {
            loop {
                let frame = Frame::Message(ChatFrame {
                    from: "flood".to_string(),
                    origin: Some(ParticipantKind::Human),
                    message: filler.clone(),
                    name: None,
                    sent_at: None,
                });
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        timeout(Duration::from_secs(15), handle.close_requested())
            .await
            .expect("writer never gave up on the stalled peer");
        timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
        timeout(Duration::from_secs(5), feeder).await.unwrap().unwrap();
        peer.abort();
    }

    #[test]
    fn test_settings_from_config() {
        let config = HubConfig::default();
        let settings = ConnectionSettings::from(&config);
        assert_eq!(settings.idle_timeout, settings.heartbeat_interval * 3);
        assert_eq!(settings.outbound_queue_size, 64);
    }
}
