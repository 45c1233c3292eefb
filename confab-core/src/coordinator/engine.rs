use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::decision::{ArbitrationMode, TurnDecision};
use super::{DynArbiter, DynResponder};
use crate::config::{AgentConfig, TriggerModeConfig};
use crate::error::{ConfabError, ConfabResult};
use crate::models::{ConversationWindow, Message, ParticipantKind, Role};
use crate::protocol::Frame;

const EVENT_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Evaluate on every inbound chat message.
    Reactive,
    /// Evaluate on a fixed timer.
    Periodic { interval: Duration },
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub agent_id: String,
    pub agent_name: String,
    pub trigger: TriggerMode,
    pub arbitration: ArbitrationMode,
    pub recent_window: usize,
    pub history_cap: usize,
    pub capability_timeout: Duration,
    pub call_delay: Duration,
}

impl CoordinatorSettings {
    pub fn new(agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self::from_config(agent_id, agent_name, &AgentConfig::default())
    }

    pub fn from_config(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        config: &AgentConfig,
    ) -> Self {
        let trigger = match config.mode {
            TriggerModeConfig::Reactive => TriggerMode::Reactive,
            TriggerModeConfig::Periodic => TriggerMode::Periodic {
                interval: config.processing_interval(),
            },
        };

        let arbitration = if config.speakers.is_empty() {
            ArbitrationMode::YesNo
        } else {
            ArbitrationMode::Moderated {
                speakers: config.speakers.clone(),
            }
        };

        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            trigger,
            arbitration,
            recent_window: config.recent_window.max(1),
            history_cap: config.history_cap.max(1),
            capability_timeout: config.capability_timeout(),
            call_delay: config.call_delay(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Inbound(Message),
    Tick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Reply published.
    Spoke(String),
    /// Arbiter declined or gave an unusable answer.
    Silent,
    /// Nothing evaluated, or a capability failed.
    Skipped(String),
}

/// One agent's decision loop. Owns the agent's history; nothing else writes
/// to it.
pub struct TurnCoordinator {
    settings: CoordinatorSettings,
    arbiter: DynArbiter,
    responder: DynResponder,
    window: ConversationWindow,
    outbound: mpsc::Sender<Frame>,
    /// Body of the latest chat message not yet evaluated. Announcements never
    /// land here.
    pending_prompt: Option<String>,
}

impl TurnCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        arbiter: DynArbiter,
        responder: DynResponder,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        let window = ConversationWindow::new(settings.history_cap);
        Self {
            settings,
            arbiter,
            responder,
            window,
            outbound,
            pending_prompt: None,
        }
    }

    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub async fn handle_event(&mut self, event: CoordinatorEvent) -> TurnOutcome {
        match event {
            CoordinatorEvent::Inbound(message) => self.on_inbound(message).await,
            CoordinatorEvent::Tick => self.on_tick().await,
        }
    }

    async fn on_inbound(&mut self, message: Message) -> TurnOutcome {
        if message.sender_id == self.settings.agent_id {
            return TurnOutcome::Skipped("own message".to_string());
        }

        self.window
            .append(message.sender_name.clone(), Role::User, message.body.clone());

        if message.is_announcement() {
            debug!(body = %message.body, "Announcement recorded");
            return TurnOutcome::Skipped("announcement".to_string());
        }

        match self.settings.trigger {
            TriggerMode::Reactive => self.evaluate_turn(message.body).await,
            TriggerMode::Periodic { .. } => {
                self.pending_prompt = Some(message.body);
                TurnOutcome::Skipped("waiting for tick".to_string())
            }
        }
    }

    async fn on_tick(&mut self) -> TurnOutcome {
        if matches!(self.settings.trigger, TriggerMode::Reactive) {
            return TurnOutcome::Skipped("reactive mode".to_string());
        }

        match self.pending_prompt.take() {
            Some(prompt) => self.evaluate_turn(prompt).await,
            None => TurnOutcome::Skipped("no new messages".to_string()),
        }
    }

    /// Asks the arbiter, and on a clear yes asks the responder and publishes
    /// the reply. Capability failures end the round silently.
    pub async fn evaluate_turn(&mut self, prompt: String) -> TurnOutcome {
        self.pending_prompt = None;

        let request = self.settings.arbitration.request(
            &self.settings.agent_name,
            self.window.recent(self.settings.recent_window),
        );

        let arbiter = self.arbiter.clone();
        let answer = match self
            .call_capability("arbiter", arbiter.decide(&request))
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                e.log();
                return TurnOutcome::Skipped(e.to_string());
            }
        };

        match self
            .settings
            .arbitration
            .interpret(&answer, &self.settings.agent_name)
        {
            TurnDecision::Speak => {}
            TurnDecision::Pass => {
                debug!(agent = %self.settings.agent_name, answer = %answer.trim(), "Not our turn");
                return TurnOutcome::Silent;
            }
            TurnDecision::Unrecognized(raw) => {
                warn!(
                    agent = %self.settings.agent_name,
                    answer = %raw.trim(),
                    "Unrecognized arbiter answer; staying silent"
                );
                return TurnOutcome::Silent;
            }
        }

        let context = self.window.full();
        let responder = self.responder.clone();
        let reply = match self
            .call_capability("responder", responder.generate(&prompt, &context))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                e.log();
                return TurnOutcome::Skipped(e.to_string());
            }
        };

        let reply = reply.trim().to_string();
        if reply.is_empty() {
            warn!(agent = %self.settings.agent_name, "Responder returned an empty reply");
            return TurnOutcome::Silent;
        }

        self.window
            .append(self.settings.agent_name.clone(), Role::User, prompt);
        self.window
            .append(self.settings.agent_name.clone(), Role::Model, reply.clone());

        let frame = Frame::chat(self.settings.agent_id.clone(), ParticipantKind::Agent, reply.clone());
        if self.outbound.send(frame).await.is_err() {
            warn!(agent = %self.settings.agent_name, "Outbound queue closed; reply dropped");
            return TurnOutcome::Skipped("outbound closed".to_string());
        }

        info!(agent = %self.settings.agent_name, chars = reply.len(), "Reply published");
        TurnOutcome::Spoke(reply)
    }

    async fn call_capability<F>(&self, capability: &str, call: F) -> ConfabResult<String>
    where
        F: Future<Output = ConfabResult<String>>,
    {
        if !self.settings.call_delay.is_zero() {
            tokio::time::sleep(self.settings.call_delay).await;
        }

        match timeout(self.settings.capability_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ConfabError::CapabilityTimeout {
                capability: capability.to_string(),
                timeout: self.settings.capability_timeout,
            }),
        }
    }

    /// Runs until shutdown is signalled or every event sender is gone.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<CoordinatorEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        info!(
            agent = %self.settings.agent_name,
            trigger = ?self.settings.trigger,
            "Turn coordinator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    info!(agent = %self.settings.agent_name, "Turn coordinator shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        let outcome = self.handle_event(event).await;
                        debug!(agent = %self.settings.agent_name, ?outcome, "Event handled");
                    }
                    None => break,
                },
            }
        }
    }

    /// Starts the decision loop and, in periodic mode, its timer task.
    pub fn spawn(self) -> CoordinatorHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let grace = self.settings.capability_timeout;

        let ticker = match self.settings.trigger {
            TriggerMode::Periodic { interval } => {
                Some(tokio::spawn(run_ticker(interval, events_tx.clone())))
            }
            TriggerMode::Reactive => None,
        };

        let task = tokio::spawn(self.run(events_rx, shutdown_rx));

        CoordinatorHandle {
            events: events_tx,
            shutdown_tx: Some(shutdown_tx),
            task,
            ticker,
            grace,
        }
    }
}

async fn run_ticker(period: Duration, events: mpsc::Sender<CoordinatorEvent>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match events.try_send(CoordinatorEvent::Tick) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Coordinator busy; tick dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

pub struct CoordinatorHandle {
    events: mpsc::Sender<CoordinatorEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    ticker: Option<JoinHandle<()>>,
    grace: Duration,
}

impl CoordinatorHandle {
    pub fn events(&self) -> mpsc::Sender<CoordinatorEvent> {
        self.events.clone()
    }

    pub async fn send(&self, event: CoordinatorEvent) -> ConfabResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ConfabError::Internal("turn coordinator stopped".to_string()))
    }

    /// Stops new triggers, lets an in-flight round finish within the
    /// capability timeout, then abandons it.
    pub async fn stop(mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if timeout(self.grace, &mut self.task).await.is_err() {
            warn!("Turn coordinator did not stop in time; abandoning in-flight round");
            self.task.abort();
        }
    }
}
