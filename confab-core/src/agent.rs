//! Runs a teammate agent: keeps a hub connection alive and feeds its
//! [`TurnCoordinator`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::{self, ChatReader, ChatWriter, Identity};
use crate::config::AgentConfig;
use crate::coordinator::{
    CoordinatorEvent, CoordinatorHandle, CoordinatorSettings, DynArbiter, DynResponder,
    HttpArbiter, HttpCapabilityConfig, HttpResponder, TurnCoordinator,
};
use crate::error::{ConfabError, ConfabResult, RetryConfig};
use crate::models::{Message, ParticipantKind};
use crate::protocol::Frame;

const OUTBOUND_QUEUE_SIZE: usize = 32;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

enum SessionEnd {
    Shutdown,
    Lost(String),
}

pub struct AgentRuntime {
    hub_url: String,
    identity: Identity,
    retry: RetryConfig,
    send_timeout: Duration,
}

impl AgentRuntime {
    pub fn new(hub_url: impl Into<String>, identity: Identity, retry: RetryConfig) -> Self {
        Self {
            hub_url: hub_url.into(),
            identity,
            retry,
            send_timeout: SEND_TIMEOUT,
        }
    }

    pub fn from_config(config: &AgentConfig, identity: Identity) -> Self {
        let retry = RetryConfig {
            max_attempts: config.reconnect_attempts,
            initial_delay: config.reconnect_delay(),
            ..RetryConfig::for_agent_reconnection()
        };
        Self::new(config.hub_url.clone(), identity, retry)
    }

    /// Advertises `host`/`port` in the connect frame.
    pub fn with_address(mut self, host: Option<String>, port: Option<u16>) -> Self {
        self.identity = self.identity.with_address(host, port);
        self
    }

    /// Outbound queue shared by every connection attempt; pass the sender to
    /// the coordinator and the receiver to [`run`](Self::run).
    pub fn outbound_channel() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        mpsc::channel(OUTBOUND_QUEUE_SIZE)
    }

    /// Connects, reconnecting after connection loss, until `shutdown`
    /// completes or reconnect attempts are exhausted.
    pub async fn run<F>(
        self,
        coordinator: TurnCoordinator,
        mut outbound: mpsc::Receiver<Frame>,
        shutdown: F,
    ) -> ConfabResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let coordinator = coordinator.spawn();
        let mut failures: u32 = 0;

        let result = loop {
            let connected = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                connected = client::connect(&self.hub_url, self.identity.clone(), self.send_timeout) => connected,
            };

            let end = match connected {
                Ok((writer, reader)) => {
                    failures = 0;
                    self.session(writer, reader, &coordinator, &mut outbound, &mut shutdown)
                        .await
                }
                Err(e) if !e.is_transport_error() => break Err(e),
                Err(e) => SessionEnd::Lost(e.to_string()),
            };

            match end {
                SessionEnd::Shutdown => break Ok(()),
                SessionEnd::Lost(reason) => {
                    failures += 1;
                    if failures >= self.retry.max_attempts {
                        error!(
                            agent = %self.identity.name,
                            attempts = failures,
                            reason = %reason,
                            "Giving up on hub connection"
                        );
                        break Err(ConfabError::ConnectionFailed {
                            url: self.hub_url.clone(),
                            message: reason,
                        });
                    }

                    let delay = self.retry.delay_for_attempt(failures - 1);
                    warn!(
                        agent = %self.identity.name,
                        attempt = failures,
                        max_attempts = self.retry.max_attempts,
                        reason = %reason,
                        "Hub connection lost; retrying in {:?}",
                        delay
                    );

                    tokio::select! {
                        _ = &mut shutdown => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        coordinator.stop().await;
        result
    }

    async fn session<F>(
        &self,
        mut writer: ChatWriter,
        mut reader: ChatReader,
        coordinator: &CoordinatorHandle,
        outbound: &mut mpsc::Receiver<Frame>,
        shutdown: &mut std::pin::Pin<&mut F>,
    ) -> SessionEnd
    where
        F: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                _ = shutdown.as_mut() => {
                    if let Err(e) = writer.disconnect().await {
                        debug!(error = %e, "Disconnect notice not delivered");
                    }
                    info!(agent = %self.identity.name, "Agent disconnected");
                    return SessionEnd::Shutdown;
                }
                frame = reader.next_frame() => match frame {
                    None => return SessionEnd::Lost("hub closed the connection".to_string()),
                    Some(Err(e)) if e.is_protocol_error() => e.log(),
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    Some(Ok(Frame::Message(chat))) => {
                        let message = Message::from(chat);
                        if coordinator.send(CoordinatorEvent::Inbound(message)).await.is_err() {
                            return SessionEnd::Lost("turn coordinator stopped".to_string());
                        }
                    }
                    Some(Ok(Frame::Ping)) => {
                        if let Err(e) = writer.pong().await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(Ok(other)) => {
                        debug!(frame = other.type_name(), "Ignoring frame from hub");
                    }
                },
                next = outbound.recv() => match next {
                    Some(frame) => {
                        if let Err(e) = writer.send(&frame).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    None => return SessionEnd::Lost("outbound queue closed".to_string()),
                },
            }
        }
    }
}

/// Reads an instruction file; an empty path yields empty instructions.
pub async fn load_instructions(path: &str) -> ConfabResult<String> {
    if path.is_empty() {
        return Ok(String::new());
    }
    if !Path::new(path).exists() {
        return Err(ConfabError::InvalidConfigValue {
            key: "instruction_file".to_string(),
            message: format!("{} does not exist", path),
        });
    }
    Ok(tokio::fs::read_to_string(path).await?)
}

/// HTTP-backed arbiter and responder built from the agent configuration.
pub async fn http_capabilities(
    config: &AgentConfig,
    agent_name: &str,
) -> ConfabResult<(DynArbiter, DynResponder)> {
    if config.arbiter_url.is_empty() || config.responder_url.is_empty() {
        return Err(ConfabError::InvalidConfigValue {
            key: "agent.arbiter_url/agent.responder_url".to_string(),
            message: "Both capability endpoints must be configured".to_string(),
        });
    }

    let instructions = load_instructions(&config.instruction_file).await?;
    let moderator_instructions = load_instructions(&config.moderator_instruction_file).await?;

    let arbiter = HttpArbiter::new(
        HttpCapabilityConfig::new(config.arbiter_url.clone())
            .with_api_key(config.api_key.clone())
            .with_instructions(moderator_instructions)
            .with_timeout(config.capability_timeout()),
    );
    let responder = HttpResponder::new(
        agent_name,
        HttpCapabilityConfig::new(config.responder_url.clone())
            .with_api_key(config.api_key.clone())
            .with_instructions(instructions)
            .with_timeout(config.capability_timeout()),
    );

    Ok((Arc::new(arbiter), Arc::new(responder)))
}

/// Wires a coordinator and runtime for one agent.
pub fn build_agent(
    config: &AgentConfig,
    id: &str,
    name: &str,
    arbiter: DynArbiter,
    responder: DynResponder,
) -> (AgentRuntime, TurnCoordinator, mpsc::Receiver<Frame>) {
    let (outbound_tx, outbound_rx) = AgentRuntime::outbound_channel();
    let settings = CoordinatorSettings::from_config(id, name, config);
    let coordinator = TurnCoordinator::new(settings, arbiter, responder, outbound_tx);
    let identity = Identity::new(id, name, ParticipantKind::Agent);
    (AgentRuntime::from_config(config, identity), coordinator, outbound_rx)
}
