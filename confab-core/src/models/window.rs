use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Model => write!(f, "model"),
            Role::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub speaker: String,
    pub role: Role,
    pub text: String,
}

impl WindowEntry {
    /// `[speaker] text`, the line format used in decision prompts.
    pub fn render(&self) -> String {
        format!("[{}] {}", self.speaker, self.text)
    }
}

/// Append-only conversation history held by one agent.
///
/// Entries keep insertion order and are never edited. Once `capacity` is
/// exceeded the oldest entries fall off the front.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
    total_appended: u64,
}

impl ConversationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total_appended: 0,
        }
    }

    pub fn append(&mut self, speaker: impl Into<String>, role: Role, text: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(WindowEntry {
            speaker: speaker.into(),
            role,
            text: text.into(),
        });
        self.total_appended += 1;
    }

    /// Every retained entry, oldest first.
    pub fn full(&self) -> Vec<WindowEntry> {
        self.entries.iter().cloned().collect()
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<WindowEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&WindowEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Monotonic count of appends, unaffected by eviction.
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}

pub fn render_entries(entries: &[WindowEntry]) -> String {
    entries
        .iter()
        .map(WindowEntry::render)
        .collect::<Vec<_>>()
        .join("\n")
}
