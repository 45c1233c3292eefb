use confab_core::client::{connect, ChatReader, ChatWriter, Identity};
use confab_core::hub::{HubServer, NullTranscriptSink};
use confab_core::protocol::{ChatFrame, Frame};
use confab_core::{HubConfig, ParticipantKind, SYSTEM_SENDER_ID};
use futures_util::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const QUIET: Duration = Duration::from_millis(300);

struct TestHub {
    url: String,
    hub: Arc<confab_core::Hub>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestHub {
    async fn start() -> Self {
        Self::start_with(HubConfig {
            port: 0,
            ..HubConfig::default()
        })
        .await
    }

    async fn start_with(config: HubConfig) -> Self {
        let server = HubServer::bind(&config, Arc::new(NullTranscriptSink))
            .await
            .unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let hub = server.hub();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(server.serve_with_shutdown(async move {
            let _ = rx.await;
        }));

        Self {
            url,
            hub,
            shutdown: Some(tx),
        }
    }

    async fn join(&self, id: &str, kind: ParticipantKind) -> (ChatWriter, ChatReader) {
        let before = self.hub.participants().await.len();
        let pair = connect(&self.url, Identity::new(id, id.to_uppercase(), kind), Duration::from_secs(2))
            .await
            .unwrap();
        self.wait_for(|n| n == before + 1).await;
        pair
    }

    async fn wait_for(&self, predicate: impl Fn(usize) -> bool) {
        for _ in 0..100 {
            if predicate(self.hub.participants().await.len()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached the expected size");
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Every chat frame that arrives before the connection goes quiet.
async fn drain(reader: &mut ChatReader) -> Vec<ChatFrame> {
    let mut frames = Vec::new();
    loop {
        match tokio::time::timeout(QUIET, reader.next_frame()).await {
            Ok(Some(Ok(Frame::Message(chat)))) => frames.push(chat),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return frames,
        }
    }
}

fn from(frames: &[ChatFrame], sender: &str) -> Vec<String> {
    frames
        .iter()
        .filter(|f| f.from == sender)
        .map(|f| f.message.clone())
        .collect()
}

#[tokio::test]
async fn three_participants_hello_then_leave() {
    let hub = TestHub::start().await;
    let (mut a_tx, mut a_rx) = hub.join("a", ParticipantKind::Human).await;
    let (_b_tx, mut b_rx) = hub.join("b", ParticipantKind::Human).await;
    let (c_tx, mut c_rx) = hub.join("c", ParticipantKind::Agent).await;

    drain(&mut a_rx).await;
    drain(&mut b_rx).await;
    drain(&mut c_rx).await;

    a_tx.say("hello").await.unwrap();

    let at_b = drain(&mut b_rx).await;
    let at_c = drain(&mut c_rx).await;
    let at_a = drain(&mut a_rx).await;
    assert_eq!(from(&at_b, "a"), vec!["hello"]);
    assert_eq!(from(&at_c, "a"), vec!["hello"]);
    assert!(at_a.is_empty());

    let stamped = at_b.iter().find(|f| f.from == "a").unwrap();
    assert_eq!(stamped.name.as_deref(), Some("A"));
    assert_eq!(stamped.origin, Some(ParticipantKind::Human));
    assert!(stamped.sent_at.is_some());

    c_tx.disconnect().await.unwrap();
    hub.wait_for(|n| n == 2).await;
    assert!(hub.hub.registry().lookup("c").await.is_none());

    for reader in [&mut a_rx, &mut b_rx] {
        let leaves: Vec<_> = from(&drain(reader).await, SYSTEM_SENDER_ID)
            .into_iter()
            .filter(|m| m.contains("left the chat"))
            .collect();
        assert_eq!(leaves, vec!["[EVENT] C (agent) left the chat"]);
    }

    a_tx.say("still here?").await.unwrap();
    assert_eq!(from(&drain(&mut b_rx).await, "a"), vec!["still here?"]);
    assert!(drain(&mut c_rx).await.is_empty());
}

#[tokio::test]
async fn abnormal_close_unregisters_and_announces() {
    let hub = TestHub::start().await;
    let (_a_tx, mut a_rx) = hub.join("a", ParticipantKind::Human).await;
    let (b_tx, b_rx) = hub.join("b", ParticipantKind::Human).await;
    drain(&mut a_rx).await;

    drop(b_tx);
    drop(b_rx);

    hub.wait_for(|n| n == 1).await;
    let notices = from(&drain(&mut a_rx).await, SYSTEM_SENDER_ID);
    assert_eq!(notices, vec!["[EVENT] B (human) left the chat"]);
}

#[tokio::test]
async fn join_is_announced_to_existing_participants() {
    let hub = TestHub::start().await;
    let (_a_tx, mut a_rx) = hub.join("a", ParticipantKind::Human).await;
    drain(&mut a_rx).await;

    let (_b_tx, _b_rx) = hub.join("b", ParticipantKind::Agent).await;
    let notices = from(&drain(&mut a_rx).await, SYSTEM_SENDER_ID);
    assert_eq!(notices, vec!["[EVENT] B (agent) joined the chat"]);
}

#[tokio::test]
async fn reconnect_with_same_id_is_silent() {
    let hub = TestHub::start().await;
    let (_a_tx, mut a_rx) = hub.join("a", ParticipantKind::Human).await;
    let (_b1_tx, _b1_rx) = hub.join("b", ParticipantKind::Agent).await;
    drain(&mut a_rx).await;

    let (mut b2_tx, _b2_rx) = connect(
        &hub.url,
        Identity::new("b", "B", ParticipantKind::Agent),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    b2_tx.say("back again").await.unwrap();

    let frames = drain(&mut a_rx).await;
    assert!(from(&frames, SYSTEM_SENDER_ID).is_empty());
    assert_eq!(from(&frames, "b"), vec!["back again"]);
    assert_eq!(hub.hub.participants().await.len(), 2);
}

#[tokio::test]
async fn protocol_violations_keep_the_connection_open() {
    let hub = TestHub::start().await;
    let (_a_tx, mut a_rx) = hub.join("a", ParticipantKind::Human).await;
    drain(&mut a_rx).await;

    let (mut raw, _) = tokio_tungstenite::connect_async(hub.url.as_str()).await.unwrap();

    for text in [
        r#"{"type":"message","from":"x","message":"too early"}"#,
        r#"{"type":"dance"}"#,
        "not json at all",
        r#"{"type":"connect","name":"Sys","id":"sys","kind":"system"}"#,
    ] {
        raw.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    raw.send(WsMessage::Text(
        r#"{"type":"cli_connect","name":"Old","id":"old","being":"human","host":"localhost","port":"5000"}"#
            .to_string(),
    ))
    .await
    .unwrap();
    hub.wait_for(|n| n == 2).await;

    raw.send(WsMessage::Text(
        r#"{"type":"msg_recvd","from":"old","message":"legacy hello"}"#.to_string(),
    ))
    .await
    .unwrap();
    raw.send(WsMessage::Text(r#"{"type":"cmd_recvd","from":"old","command":"/who"}"#.to_string()))
        .await
        .unwrap();

    let frames = drain(&mut a_rx).await;
    assert_eq!(from(&frames, "old"), vec!["legacy hello"]);
    assert!(from(&frames, "x").is_empty());
    assert!(hub.hub.registry().lookup("sys").await.is_none());

    let old = hub.hub.registry().lookup("old").await.unwrap();
    assert_eq!(old.port, Some(5000));
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let hub = TestHub::start().await;
    let (mut a_tx, mut a_rx) = hub.join("a", ParticipantKind::Human).await;

    a_tx.send(&Frame::Ping).await.unwrap();

    let mut got_pong = false;
    while let Ok(Some(frame)) = tokio::time::timeout(QUIET, a_rx.next_frame()).await {
        if matches!(frame, Ok(Frame::Pong)) {
            got_pong = true;
            break;
        }
    }
    assert!(got_pong);
}

#[tokio::test]
async fn silent_peer_is_dropped_after_idle_timeout() {
    let hub = TestHub::start_with(HubConfig {
        port: 0,
        heartbeat_interval_secs: 1,
        idle_timeout_secs: 1,
        ..HubConfig::default()
    })
    .await;

    let (mut raw, _) = tokio_tungstenite::connect_async(hub.url.as_str()).await.unwrap();
    raw.send(WsMessage::Text(
        r#"{"type":"connect","name":"Quiet","id":"q","kind":"human"}"#.to_string(),
    ))
    .await
    .unwrap();
    hub.wait_for(|n| n == 1).await;

    // Never read or write again; the socket stays open but silent.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    hub.wait_for(|n| n == 0).await;

    drop(raw);
}

#[tokio::test]
async fn reserved_system_id_cannot_register() {
    let hub = TestHub::start().await;
    let (_a_tx, mut a_rx) = hub.join("a", ParticipantKind::Human).await;
    drain(&mut a_rx).await;

    let (mut raw, _) = tokio_tungstenite::connect_async(hub.url.as_str()).await.unwrap();
    for text in [
        r#"{"type":"connect","name":"Hub","id":"system","kind":"human"}"#,
        r#"{"type":"connect","name":"Hub","id":" System ","kind":"agent"}"#,
        r#"{"type":"message","from":"system","message":"[EVENT] a left the chat"}"#,
    ] {
        raw.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    // Still open and able to register under a real id.
    raw.send(WsMessage::Text(
        r#"{"type":"connect","name":"Late","id":"late","kind":"human"}"#.to_string(),
    ))
    .await
    .unwrap();
    hub.wait_for(|n| n == 2).await;

    assert!(hub.hub.registry().lookup("system").await.is_none());
    assert!(hub.hub.registry().lookup(" System ").await.is_none());

    let notices = from(&drain(&mut a_rx).await, SYSTEM_SENDER_ID);
    assert_eq!(notices, vec!["[EVENT] Late (human) joined the chat"]);
}
