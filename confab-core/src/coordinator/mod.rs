//! Per-agent turn taking.
//!
//! An agent never speaks on its own initiative: a [`TurnArbiter`] is asked
//! first, and only an unambiguous "your turn" leads to a [`Responder`] call.

mod decision;
mod engine;
pub mod http;

pub use decision::{normalize_answer, ArbitrationMode, TurnDecision};
pub use engine::{
    CoordinatorEvent, CoordinatorHandle, CoordinatorSettings, TriggerMode, TurnCoordinator,
    TurnOutcome,
};
pub use http::{HttpArbiter, HttpCapabilityConfig, HttpResponder};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ConfabResult;
use crate::models::WindowEntry;

/// Generates an agent's reply.
#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &str;

    /// `prompt` is the message being answered, `context` the full retained
    /// history, oldest first.
    async fn generate(&self, prompt: &str, context: &[WindowEntry]) -> ConfabResult<String>;
}

/// Decides whether, or who, speaks next. Returns the raw answer; the
/// coordinator interprets it.
#[async_trait]
pub trait TurnArbiter: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, request: &ArbitrationRequest) -> ConfabResult<String>;
}

pub type DynResponder = Arc<dyn Responder>;
pub type DynArbiter = Arc<dyn TurnArbiter>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationRequest {
    pub agent_name: String,
    pub question: String,
    pub context: Vec<WindowEntry>,
    /// Known speakers in moderated mode, empty for yes/no.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}
