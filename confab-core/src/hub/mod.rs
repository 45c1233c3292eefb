//! The relay: who is connected, and how messages reach them.

mod notifier;
mod registry;
mod router;
pub mod server;
pub mod transcript;

pub use notifier::PresenceNotifier;
pub use registry::{ConnectionRegistry, Registration};
pub use router::{BroadcastRouter, DeliveryFailure, DeliveryReport, Eviction};
pub use server::HubServer;
pub use transcript::{
    CompositeTranscriptSink, ConsoleTranscriptSink, DynTranscriptSink, FileTranscriptSink,
    NullTranscriptSink, TranscriptEntry, TranscriptFormat, TranscriptSink,
};

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::models::{Message, Participant, SYSTEM_SENDER_ID};

/// Shared hub state: registry, router and notifier behind one API.
///
/// Membership changes and their announcements run under one mutex, so every
/// participant observes a given id's Join before its Leave.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    router: BroadcastRouter,
    notifier: PresenceNotifier,
    membership: Mutex<()>,
}

impl Hub {
    /// Builds the hub and starts the task that unregisters recipients the
    /// router gave up on. Must be called inside a tokio runtime.
    pub fn new(sink: DynTranscriptSink, delivery_timeout: Duration) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let router = BroadcastRouter::new(registry.clone(), sink, delivery_timeout)
            .with_evictions(evict_tx);

        let hub = Arc::new(Self {
            registry,
            router,
            notifier: PresenceNotifier::new(),
            membership: Mutex::new(()),
        });

        tokio::spawn(run_reaper(Arc::downgrade(&hub), evict_rx));
        hub
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Registers and announces fresh joins. Reconnects under a known id are
    /// silent.
    pub async fn register(&self, participant: Participant) -> Registration {
        let _guard = self.membership.lock().await;
        let announcement = self.notifier.on_join(&participant);
        let outcome = self.registry.register(participant).await;

        match &outcome {
            Registration::Joined => {
                self.router.route(SYSTEM_SENDER_ID, &announcement).await;
            }
            Registration::Reconnected { previous } => {
                previous.handle.request_close();
            }
        }
        outcome
    }

    /// Removes `id` and announces the leave. Absent ids are a no-op.
    pub async fn unregister(&self, id: &str) -> Option<Participant> {
        let _guard = self.membership.lock().await;
        let removed = self.registry.unregister(id).await;
        if let Some(participant) = &removed {
            self.announce_leave(participant).await;
        }
        removed
    }

    /// Like [`unregister`](Self::unregister), but only while `connection_id`
    /// still owns the entry.
    pub async fn unregister_connection(&self, id: &str, connection_id: u64) -> Option<Participant> {
        let _guard = self.membership.lock().await;
        let removed = self.registry.unregister_connection(id, connection_id).await;
        if let Some(participant) = &removed {
            self.announce_leave(participant).await;
        }
        removed
    }

    pub async fn route(&self, sender_id: &str, message: &Message) -> DeliveryReport {
        self.router.route(sender_id, message).await
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.registry.snapshot().await
    }

    async fn announce_leave(&self, participant: &Participant) {
        let announcement = self.notifier.on_leave(participant);
        self.router.route(SYSTEM_SENDER_ID, &announcement).await;
    }
}

async fn run_reaper(hub: Weak<Hub>, mut evictions: mpsc::UnboundedReceiver<Eviction>) {
    while let Some(eviction) = evictions.recv().await {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        info!(
            participant_id = %eviction.participant_id,
            connection = eviction.connection_id,
            reason = %eviction.reason,
            "Evicting unreachable participant"
        );
        hub.unregister_connection(&eviction.participant_id, eviction.connection_id)
            .await;
    }
    debug!("Eviction reaper stopped");
}
