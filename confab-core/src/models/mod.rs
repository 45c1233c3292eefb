mod message;
mod participant;
mod window;

pub use message::{is_event_text, Message, MessageKind, EVENT_TAG, SYSTEM_SENDER_ID};
pub use participant::{ConnectionHandle, Participant, ParticipantKind};
pub use window::{render_entries, ConversationWindow, Role, WindowEntry};
