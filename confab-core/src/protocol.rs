//! JSON frames exchanged between the hub and its clients.
//!
//! Every WebSocket text frame carries one object tagged by `type`. Older
//! clients use `cli_connect`/`ai_connect`, `msg_recvd` and friends; those are
//! folded onto the canonical names by [`Frame::decode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ConfabError, ConfabResult};
use crate::models::{Message, MessageKind, ParticipantKind, SYSTEM_SENDER_ID};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Connect(ConnectFrame),
    Disconnect(DisconnectFrame),
    Message(ChatFrame),
    Ping,
    Pong,
    Command(CommandFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectFrame {
    pub name: String,
    pub id: String,
    #[serde(default, alias = "being")]
    pub kind: ParticipantKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectFrame {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFrame {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ParticipantKind>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl ChatFrame {
    /// Display name when the hub stamped one, otherwise the sender id.
    pub fn speaker(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub from: String,
    pub command: String,
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("port out of range: {}", n))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid port: {}", s))),
        Some(other) => Err(D::Error::custom(format!("invalid port: {}", other))),
    }
}

/// Maps a wire `type` onto its canonical name and the participant kind the
/// legacy connect names imply.
fn canonical_type(raw: &str) -> Option<(&'static str, Option<ParticipantKind>)> {
    let mapped = match raw {
        "connect" => ("connect", None),
        "human_connect" | "cli_connect" => ("connect", Some(ParticipantKind::Human)),
        "agent_connect" | "ai_connect" => ("connect", Some(ParticipantKind::Agent)),
        "disconnect" | "human_disconnect" | "agent_disconnect" | "cli_disconnect"
        | "ai_disconnect" => ("disconnect", None),
        "message" | "msg_recvd" => ("message", None),
        "command" | "cmd_recvd" => ("command", None),
        "ping" => ("ping", None),
        "pong" => ("pong", None),
        _ => return None,
    };
    Some(mapped)
}

impl Frame {
    pub fn decode(text: &str) -> ConfabResult<Self> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| ConfabError::MalformedFrame(e.to_string()))?;

        let object = value
            .as_object_mut()
            .ok_or_else(|| ConfabError::MalformedFrame("expected a JSON object".to_string()))?;

        let raw_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfabError::MalformedFrame("missing 'type' field".to_string()))?
            .to_string();

        let (canonical, implied_kind) = canonical_type(&raw_type)
            .ok_or_else(|| ConfabError::UnknownFrameType(raw_type.clone()))?;

        object.insert("type".to_string(), Value::String(canonical.to_string()));
        if let Some(kind) = implied_kind {
            if !object.contains_key("kind") && !object.contains_key("being") {
                object.insert("kind".to_string(), Value::String(kind.to_string()));
            }
        }

        serde_json::from_value(value)
            .map_err(|e| ConfabError::MalformedFrame(format!("{}: {}", raw_type, e)))
    }

    pub fn encode(&self) -> ConfabResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Connect(_) => "connect",
            Frame::Disconnect(_) => "disconnect",
            Frame::Message(_) => "message",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Command(_) => "command",
        }
    }

    pub fn connect(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: ParticipantKind,
        host: Option<String>,
        port: Option<u16>,
    ) -> Self {
        Frame::Connect(ConnectFrame {
            name: name.into(),
            id: id.into(),
            kind,
            host,
            port,
        })
    }

    pub fn disconnect(id: impl Into<String>) -> Self {
        Frame::Disconnect(DisconnectFrame { id: id.into() })
    }

    /// A chat line as a client sends it; the hub fills in the rest.
    pub fn chat(from: impl Into<String>, origin: ParticipantKind, message: impl Into<String>) -> Self {
        Frame::Message(ChatFrame {
            from: from.into(),
            origin: Some(origin),
            message: message.into(),
            name: None,
            sent_at: None,
        })
    }

    pub fn command(from: impl Into<String>, command: impl Into<String>) -> Self {
        Frame::Command(CommandFrame {
            from: from.into(),
            command: command.into(),
        })
    }
}

impl From<&Message> for Frame {
    fn from(message: &Message) -> Self {
        Frame::Message(ChatFrame {
            from: message.sender_id.clone(),
            origin: Some(message.origin),
            message: message.body.clone(),
            name: Some(message.sender_name.clone()),
            sent_at: Some(message.sent_at),
        })
    }
}

impl From<ChatFrame> for Message {
    fn from(chat: ChatFrame) -> Self {
        let origin = match chat.origin {
            Some(origin) => origin,
            None if chat.from == SYSTEM_SENDER_ID => ParticipantKind::System,
            None => ParticipantKind::Human,
        };

        Message {
            kind: MessageKind::Chat,
            sender_name: chat.speaker().to_string(),
            sender_id: chat.from,
            origin,
            body: chat.message,
            sent_at: chat.sent_at.unwrap_or_else(Utc::now),
        }
    }
}
