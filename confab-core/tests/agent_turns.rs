use async_trait::async_trait;
use confab_core::agent::build_agent;
use confab_core::client::{connect, ChatReader, Identity};
use confab_core::coordinator::{ArbitrationRequest, Responder, TurnArbiter};
use confab_core::hub::{HubServer, NullTranscriptSink};
use confab_core::protocol::{ChatFrame, Frame};
use confab_core::{AgentConfig, ConfabResult, HubConfig, ParticipantKind, TriggerModeConfig, WindowEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct FixedArbiter(&'static str);

#[async_trait]
impl TurnArbiter for FixedArbiter {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn decide(&self, _request: &ArbitrationRequest) -> ConfabResult<String> {
        Ok(self.0.to_string())
    }
}

struct Shout;

#[async_trait]
impl Responder for Shout {
    fn name(&self) -> &str {
        "shout"
    }

    async fn generate(&self, prompt: &str, _context: &[WindowEntry]) -> ConfabResult<String> {
        Ok(prompt.to_uppercase())
    }
}

async fn start_hub() -> (String, Arc<confab_core::Hub>, oneshot::Sender<()>) {
    let config = HubConfig {
        port: 0,
        ..HubConfig::default()
    };
    let server = HubServer::bind(&config, Arc::new(NullTranscriptSink))
        .await
        .unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let hub = server.hub();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.serve_with_shutdown(async move {
        let _ = rx.await;
    }));
    (url, hub, tx)
}

async fn wait_for_agent(hub: &confab_core::Hub, id: &str) {
    for _ in 0..100 {
        if hub.registry().contains(id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent {} never registered", id);
}

async fn chats_from(reader: &mut ChatReader, sender: &str, quiet: Duration) -> Vec<ChatFrame> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = tokio::time::timeout(quiet, reader.next_frame()).await {
        if let Ok(Frame::Message(chat)) = frame {
            if chat.from == sender {
                frames.push(chat);
            }
        }
    }
    frames
}

fn reactive_config(hub_url: &str) -> AgentConfig {
    AgentConfig {
        hub_url: hub_url.to_string(),
        mode: TriggerModeConfig::Reactive,
        capability_timeout_secs: 5,
        ..AgentConfig::default()
    }
}

#[tokio::test]
async fn agent_replies_when_arbiter_says_yes() {
    let (url, hub, _hub_shutdown) = start_hub().await;
    let config = reactive_config(&url);

    let (runtime, coordinator, outbound) =
        build_agent(&config, "bot-1", "Ada", Arc::new(FixedArbiter("Yes.")), Arc::new(Shout));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let agent = tokio::spawn(runtime.run(coordinator, outbound, async move {
        let _ = stop_rx.await;
    }));
    wait_for_agent(&hub, "bot-1").await;

    let (mut human, mut human_rx) = connect(
        &url,
        Identity::new("gabe", "Gabe", ParticipantKind::Human),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    human.say("hello team").await.unwrap();

    let replies = chats_from(&mut human_rx, "bot-1", Duration::from_millis(500)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message, "HELLO TEAM");
    assert_eq!(replies[0].name.as_deref(), Some("Ada"));
    assert_eq!(replies[0].origin, Some(ParticipantKind::Agent));

    stop_tx.send(()).unwrap();
    agent.await.unwrap().unwrap();

    for _ in 0..100 {
        if !hub.registry().contains("bot-1").await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent stayed registered after shutdown");
}

#[tokio::test]
async fn agent_stays_silent_on_unusable_answer() {
    let (url, hub, _hub_shutdown) = start_hub().await;
    let config = reactive_config(&url);

    let (runtime, coordinator, outbound) = build_agent(
        &config,
        "bot-2",
        "Ada",
        Arc::new(FixedArbiter("I would rather not say")),
        Arc::new(Shout),
    );
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let agent = tokio::spawn(runtime.run(coordinator, outbound, async move {
        let _ = stop_rx.await;
    }));
    wait_for_agent(&hub, "bot-2").await;

    let (mut human, mut human_rx) = connect(
        &url,
        Identity::new("gabe", "Gabe", ParticipantKind::Human),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    human.say("anyone there?").await.unwrap();

    assert!(chats_from(&mut human_rx, "bot-2", Duration::from_millis(500))
        .await
        .is_empty());

    stop_tx.send(()).unwrap();
    agent.await.unwrap().unwrap();
}
