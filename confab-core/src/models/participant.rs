use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::protocol::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantKind {
    #[default]
    #[serde(alias = "cli")]
    Human,
    #[serde(alias = "ai", alias = "bot")]
    Agent,
    System,
}

impl ParticipantKind {
    /// Whether a client may register with this kind.
    pub fn is_connectable(&self) -> bool {
        !matches!(self, ParticipantKind::System)
    }
}

impl std::fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantKind::Human => write!(f, "human"),
            ParticipantKind::Agent => write!(f, "agent"),
            ParticipantKind::System => write!(f, "system"),
        }
    }
}

/// Outbound side of one live connection.
///
/// The hub's writer task owns the socket; everything else reaches the peer
/// by pushing frames into this queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: u64,
    tx: mpsc::Sender<Frame>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(connection_id: u64, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            connection_id,
            tx,
            close: Arc::new(Notify::new()),
        }
    }

    /// Asks the owning connection task to shut down.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Completes once [`request_close`](Self::request_close) has been called.
    pub async fn close_requested(&self) {
        self.close.notified().await;
    }

    pub fn sender(&self) -> &mpsc::Sender<Frame> {
        &self.tx
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub kind: ParticipantKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub joined_at: DateTime<Utc>,
    pub handle: ConnectionHandle,
}

impl Participant {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        kind: ParticipantKind,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            kind,
            host: None,
            port: None,
            joined_at: Utc::now(),
            handle,
        }
    }

    pub fn with_address(mut self, host: Option<String>, port: Option<u16>) -> Self {
        self.host = host;
        self.port = port;
        self
    }

    pub fn connection_id(&self) -> u64 {
        self.handle.connection_id
    }

    pub fn is_agent(&self) -> bool {
        self.kind == ParticipantKind::Agent
    }

    pub fn is_human(&self) -> bool {
        self.kind == ParticipantKind::Human
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(ParticipantKind::Human.to_string(), "human");
        assert_eq!(ParticipantKind::Agent.to_string(), "agent");
        assert_eq!(ParticipantKind::System.to_string(), "system");
    }

    #[test]
    fn test_kind_legacy_aliases() {
        let kind: ParticipantKind = serde_json::from_str("\"ai\"").unwrap();
        assert_eq!(kind, ParticipantKind::Agent);
        let kind: ParticipantKind = serde_json::from_str("\"cli\"").unwrap();
        assert_eq!(kind, ParticipantKind::Human);
        assert!(!ParticipantKind::System.is_connectable());
    }

    #[test]
    fn test_participant_new() {
        let (tx, _rx) = mpsc::channel(1);
        let participant = Participant::new("a1", "Ada", ParticipantKind::Agent, ConnectionHandle::new(7, tx))
            .with_address(Some("10.0.0.2".to_string()), Some(8001));

        assert_eq!(participant.connection_id(), 7);
        assert!(participant.is_agent());
        assert!(!participant.is_human());
        assert_eq!(participant.port, Some(8001));
    }

    #[test]
    fn test_handle_closed_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(1, tx);
        assert!(!handle.is_closed());
        drop(rx);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_close_request_is_remembered() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(1, tx);
        handle.clone().request_close();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle.close_requested())
            .await
            .unwrap();
    }
}
