use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, warn};

use super::registry::ConnectionRegistry;
use super::transcript::{DynTranscriptSink, TranscriptEntry};
use crate::models::{Message, Participant};
use crate::protocol::Frame;

/// A recipient the router gave up on; the hub unregisters it asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub participant_id: String,
    pub connection_id: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub participant_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    sink: DynTranscriptSink,
    evictions: Option<mpsc::UnboundedSender<Eviction>>,
    delivery_timeout: Duration,
}

impl BroadcastRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sink: DynTranscriptSink,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sink,
            evictions: None,
            delivery_timeout,
        }
    }

    pub fn with_evictions(mut self, evictions: mpsc::UnboundedSender<Eviction>) -> Self {
        self.evictions = Some(evictions);
        self
    }

    /// Delivers `message` to every registered participant except `sender_id`.
    ///
    /// Recipients are served concurrently from one registry snapshot. A
    /// broken or stalled recipient is reported and queued for eviction
    /// without holding up the rest. Callers that await each `route` before
    /// issuing the next get per-recipient FIFO, since every recipient has a
    /// single ordered queue.
    pub async fn route(&self, sender_id: &str, message: &Message) -> DeliveryReport {
        let snapshot = self.registry.snapshot().await;
        let frame = Frame::from(message);

        let deliveries = snapshot
            .into_iter()
            .filter(|p| p.id != sender_id)
            .map(|recipient| {
                let frame = frame.clone();
                async move {
                    let outcome = self.deliver(&recipient, frame).await;
                    (recipient, outcome)
                }
            });

        let mut report = DeliveryReport::default();
        for (recipient, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(()) => report.delivered.push(recipient.id),
                Err(reason) => {
                    warn!(
                        recipient = %recipient.id,
                        sender = %sender_id,
                        reason = %reason,
                        "Delivery failed; recipient presumed disconnected"
                    );
                    self.evict(&recipient, &reason);
                    report.failed.push(DeliveryFailure {
                        participant_id: recipient.id,
                        reason,
                    });
                }
            }
        }

        debug!(
            sender = %sender_id,
            kind = %message.kind,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Message routed"
        );

        self.sink.append(TranscriptEntry::from(message));
        report
    }

    async fn deliver(&self, recipient: &Participant, frame: Frame) -> Result<(), String> {
        match recipient
            .handle
            .sender()
            .send_timeout(frame, self.delivery_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err("connection closed".to_string()),
            Err(SendTimeoutError::Timeout(_)) => Err(format!(
                "outbound queue full for {:?}",
                self.delivery_timeout
            )),
        }
    }

    fn evict(&self, recipient: &Participant, reason: &str) {
        recipient.handle.request_close();

        if let Some(evictions) = &self.evictions {
            let _ = evictions.send(Eviction {
                participant_id: recipient.id.clone(),
                connection_id: recipient.connection_id(),
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::transcript::TranscriptSink;
    use crate::models::{ConnectionHandle, ParticipantKind};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<TranscriptEntry>>);

    impl TranscriptSink for RecordingSink {
        fn append(&self, entry: TranscriptEntry) {
            self.0.lock().unwrap().push(entry);
        }
    }

    async fn join(
        registry: &ConnectionRegistry,
        id: &str,
        connection_id: u64,
        capacity: usize,
    ) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(capacity);
        registry
            .register(Participant::new(
                id,
                id,
                ParticipantKind::Human,
                ConnectionHandle::new(connection_id, tx),
            ))
            .await;
        rx
    }

    fn body(frame: Frame) -> String {
        match frame {
            Frame::Message(m) => m.message,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_excludes_sender() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut a = join(&registry, "a", 1, 8).await;
        let mut b = join(&registry, "b", 2, 8).await;
        let sink = Arc::new(RecordingSink::default());
        let router = BroadcastRouter::new(registry, sink.clone(), Duration::from_millis(100));

        let report = router
            .route("a", &Message::chat("a", "a", ParticipantKind::Human, "hi"))
            .await;

        assert_eq!(report.delivered, vec!["b"]);
        assert!(report.is_complete());
        assert_eq!(body(b.recv().await.unwrap()), "hi");
        assert!(a.try_recv().is_err());
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_times_out_and_is_evicted() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _slow = join(&registry, "slow", 1, 1).await;
        let mut fast = join(&registry, "fast", 2, 8).await;
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let router = BroadcastRouter::new(
            registry,
            Arc::new(RecordingSink::default()),
            Duration::from_millis(20),
        )
        .with_evictions(evict_tx);

        let first = Message::system(crate::models::MessageKind::Join, "[EVENT] x");
        router.route("system", &first).await;
        let report = router.route("system", &first).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].participant_id, "slow");
        assert_eq!(report.delivered, vec!["fast"]);
        assert_eq!(evict_rx.recv().await.unwrap().participant_id, "slow");
        assert!(fast.recv().await.is_some());
        assert!(fast.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_empty_registry_still_records_transcript() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let router = BroadcastRouter::new(registry, sink.clone(), Duration::from_millis(20));

        let report = router
            .route("a", &Message::chat("a", "Ada", ParticipantKind::Human, "anyone?"))
            .await;

        assert_eq!(report.recipients(), 0);
        assert_eq!(sink.0.lock().unwrap()[0].body, "anyone?");
    }
}
