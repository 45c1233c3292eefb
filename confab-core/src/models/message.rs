use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::participant::ParticipantKind;

/// Sender id carried by every hub-synthesized announcement.
pub const SYSTEM_SENDER_ID: &str = "system";

/// Prefix marking announcement bodies; agents never reply to these.
pub const EVENT_TAG: &str = "[EVENT]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Join,
    Leave,
    Ping,
    Command,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Chat => write!(f, "chat"),
            MessageKind::Join => write!(f, "join"),
            MessageKind::Leave => write!(f, "leave"),
            MessageKind::Ping => write!(f, "ping"),
            MessageKind::Command => write!(f, "command"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub sender_id: String,
    pub sender_name: String,
    pub origin: ParticipantKind,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn chat(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        origin: ParticipantKind,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Chat,
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            origin,
            body: body.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn system(kind: MessageKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            sender_id: SYSTEM_SENDER_ID.to_string(),
            sender_name: SYSTEM_SENDER_ID.to_string(),
            origin: ParticipantKind::System,
            body: body.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn ping(sender_id: impl Into<String>, origin: ParticipantKind) -> Self {
        let sender_id = sender_id.into();
        Self {
            kind: MessageKind::Ping,
            sender_name: sender_id.clone(),
            sender_id,
            origin,
            body: String::new(),
            sent_at: Utc::now(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.sender_id == SYSTEM_SENDER_ID
    }

    /// Join/leave notices and anything else tagged as an event.
    pub fn is_announcement(&self) -> bool {
        matches!(self.kind, MessageKind::Join | MessageKind::Leave) || is_event_text(&self.body)
    }
}

pub fn is_event_text(body: &str) -> bool {
    body.trim_start().starts_with(EVENT_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message_invariants() {
        let msg = Message::system(MessageKind::Join, "[EVENT] Ada joined");
        assert_eq!(msg.sender_id, SYSTEM_SENDER_ID);
        assert_eq!(msg.origin, ParticipantKind::System);
        assert!(msg.is_system());
        assert!(msg.is_announcement());
    }

    #[test]
    fn test_chat_is_not_announcement() {
        let msg = Message::chat("a", "Ada", ParticipantKind::Human, "hello");
        assert!(!msg.is_announcement());
        assert!(!msg.is_system());
        assert_eq!(msg.kind.to_string(), "chat");
    }

    #[test]
    fn test_event_tag_detection() {
        assert!(is_event_text("[EVENT] Bob left the chat"));
        assert!(is_event_text("  [EVENT] padded"));
        assert!(!is_event_text("an [EVENT] in the middle"));
    }

    #[test]
    fn test_ping_has_no_body() {
        let msg = Message::ping("a", ParticipantKind::Agent);
        assert_eq!(msg.kind, MessageKind::Ping);
        assert!(msg.body.is_empty());
    }
}
