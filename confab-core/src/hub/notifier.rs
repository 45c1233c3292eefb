use crate::models::{Message, MessageKind, Participant, EVENT_TAG};

/// Builds the system announcements for membership changes.
#[derive(Debug, Clone, Default)]
pub struct PresenceNotifier;

impl PresenceNotifier {
    pub fn new() -> Self {
        Self
    }

    pub fn on_join(&self, participant: &Participant) -> Message {
        Message::system(
            MessageKind::Join,
            format!(
                "{} {} ({}) joined the chat",
                EVENT_TAG, participant.display_name, participant.kind
            ),
        )
    }

    pub fn on_leave(&self, participant: &Participant) -> Message {
        Message::system(
            MessageKind::Leave,
            format!(
                "{} {} ({}) left the chat",
                EVENT_TAG, participant.display_name, participant.kind
            ),
        )
    }
}
