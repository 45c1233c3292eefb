//! Responder and arbiter backed by a plain JSON-over-HTTP endpoint.
//!
//! Responder endpoints receive `{agent, instructions, prompt, context}` and
//! answer `{"reply": "..."}` (`text` is accepted too). Arbiter endpoints
//! receive `{agent, instructions, question, context, candidates}` and answer
//! `{"answer": "..."}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{ArbitrationRequest, Responder, TurnArbiter};
use crate::error::{ConfabError, ConfabResult};
use crate::models::WindowEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCapabilityConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Persona or moderator instructions forwarded with every call.
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timeout_seconds: u64,
}

impl HttpCapabilityConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            instructions: String::new(),
            headers: HashMap::new(),
            timeout_seconds: 60,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs().max(1);
        self
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Responder,
    Arbiter,
}

impl Kind {
    fn label(&self) -> &'static str {
        match self {
            Kind::Responder => "responder",
            Kind::Arbiter => "arbiter",
        }
    }

    fn failure(&self, message: String) -> ConfabError {
        match self {
            Kind::Responder => ConfabError::GenerationError(message),
            Kind::Arbiter => ConfabError::ArbitrationError(message),
        }
    }
}

struct HttpEndpoint {
    config: HttpCapabilityConfig,
    client: reqwest::Client,
    kind: Kind,
}

impl HttpEndpoint {
    fn new(config: HttpCapabilityConfig, kind: Kind) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            client,
            kind,
        }
    }

    async fn post(&self, payload: &Value) -> ConfabResult<Value> {
        if self.config.url.is_empty() {
            return Err(ConfabError::CapabilityUnavailable(format!(
                "no {} URL configured",
                self.kind.label()
            )));
        }

        let mut request = self.client.post(&self.config.url).json(payload);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ConfabError::CapabilityTimeout {
                    capability: self.kind.label().to_string(),
                    timeout: Duration::from_secs(self.config.timeout_seconds),
                }
            } else if e.is_connect() {
                ConfabError::CapabilityUnavailable(format!("{}: {}", self.config.url, e))
            } else {
                self.kind.failure(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self
                .kind
                .failure(format!("HTTP {}: {}", status, truncate(&body, 200))));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| self.kind.failure(format!("invalid JSON response: {}", e)))?;

        debug!(capability = self.kind.label(), url = %self.config.url, "Capability call succeeded");
        Ok(value)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

pub struct HttpResponder {
    endpoint: HttpEndpoint,
    agent_name: String,
}

impl HttpResponder {
    pub fn new(agent_name: impl Into<String>, config: HttpCapabilityConfig) -> Self {
        Self {
            endpoint: HttpEndpoint::new(config, Kind::Responder),
            agent_name: agent_name.into(),
        }
    }
}

#[async_trait]
impl Responder for HttpResponder {
    fn name(&self) -> &str {
        "http_responder"
    }

    async fn generate(&self, prompt: &str, context: &[WindowEntry]) -> ConfabResult<String> {
        let payload = serde_json::json!({
            "agent": self.agent_name,
            "instructions": self.endpoint.config.instructions,
            "prompt": prompt,
            "context": context,
        });

        let value = self.endpoint.post(&payload).await?;
        string_field(&value, &["reply", "text"]).ok_or_else(|| {
            ConfabError::GenerationError("response has no 'reply' field".to_string())
        })
    }
}

pub struct HttpArbiter {
    endpoint: HttpEndpoint,
}

impl HttpArbiter {
    pub fn new(config: HttpCapabilityConfig) -> Self {
        Self {
            endpoint: HttpEndpoint::new(config, Kind::Arbiter),
        }
    }
}

#[async_trait]
impl TurnArbiter for HttpArbiter {
    fn name(&self) -> &str {
        "http_arbiter"
    }

    async fn decide(&self, request: &ArbitrationRequest) -> ConfabResult<String> {
        let payload = serde_json::json!({
            "agent": request.agent_name,
            "instructions": self.endpoint.config.instructions,
            "question": request.question,
            "context": request.context,
            "candidates": request.candidates,
        });

        let value = self.endpoint.post(&payload).await?;
        string_field(&value, &["answer"]).ok_or_else(|| {
            ConfabError::ArbitrationError("response has no 'answer' field".to_string())
        })
    }
}
