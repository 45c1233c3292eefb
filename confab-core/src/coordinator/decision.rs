use serde::{Deserialize, Serialize};

use super::ArbitrationRequest;
use crate::models::{render_entries, WindowEntry};

/// How the arbiter's answer is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ArbitrationMode {
    /// "Should this agent speak next?" answered yes or no.
    #[default]
    YesNo,
    /// "Who speaks next?" answered with one of `speakers`.
    Moderated { speakers: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnDecision {
    Speak,
    Pass,
    /// Outside the accepted answer set; treated as pass.
    Unrecognized(String),
}

impl TurnDecision {
    pub fn should_speak(&self) -> bool {
        matches!(self, TurnDecision::Speak)
    }
}

impl ArbitrationMode {
    pub fn request(&self, agent_name: &str, context: Vec<WindowEntry>) -> ArbitrationRequest {
        let (question, candidates) = match self {
            ArbitrationMode::YesNo => (
                format!(
                    "Based on the following conversation, should {} speak next?\n\n{}\n\nRespond with YES or NO.",
                    agent_name,
                    render_entries(&context)
                ),
                Vec::new(),
            ),
            ArbitrationMode::Moderated { speakers } => {
                let history = context
                    .iter()
                    .map(|e| format!("{} ({}): {}", e.speaker, e.role, e.text))
                    .collect::<Vec<_>>()
                    .join("\n");
                (
                    format!(
                        "Based on the following conversation, who should speak next?\n\n{}\n\nRespond with ONLY the next speaker's name, e.g., \"{}\"",
                        history,
                        speakers.first().map(String::as_str).unwrap_or(agent_name)
                    ),
                    speakers.clone(),
                )
            }
        };

        ArbitrationRequest {
            agent_name: agent_name.to_string(),
            question,
            context,
            candidates,
        }
    }

    pub fn interpret(&self, answer: &str, agent_name: &str) -> TurnDecision {
        let normalized = normalize_answer(answer);

        match self {
            ArbitrationMode::YesNo => match normalized.as_str() {
                "yes" | "y" => TurnDecision::Speak,
                "no" | "n" => TurnDecision::Pass,
                _ => TurnDecision::Unrecognized(answer.to_string()),
            },
            ArbitrationMode::Moderated { speakers } => {
                if normalized == normalize_answer(agent_name) {
                    TurnDecision::Speak
                } else if speakers.iter().any(|s| normalize_answer(s) == normalized) {
                    TurnDecision::Pass
                } else {
                    TurnDecision::Unrecognized(answer.to_string())
                }
            }
        }
    }
}

/// Lowercases and strips whitespace, wrapping quotes or brackets and
/// trailing punctuation, so `"Yes."` and `yes` compare equal.
pub fn normalize_answer(raw: &str) -> String {
    const WRAPPERS: &[char] = &['"', '\'', '`', '*', '[', ']', '(', ')'];
    const TRAILING: &[char] = &['.', '!', '?', ',', ';', ':'];

    raw.trim()
        .trim_matches(|c: char| WRAPPERS.contains(&c) || c.is_whitespace())
        .trim_end_matches(|c: char| TRAILING.contains(&c) || c.is_whitespace())
        .trim_matches(|c: char| WRAPPERS.contains(&c) || c.is_whitespace())
        .to_lowercase()
}
