use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::Participant;

/// Outcome of [`ConnectionRegistry::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// The id was not present before.
    Joined,
    /// The id was present; its connection handle has been replaced.
    Reconnected { previous: Participant },
}

impl Registration {
    pub fn is_fresh_join(&self) -> bool {
        matches!(self, Registration::Joined)
    }
}

/// Live participants keyed by id.
///
/// All mutation goes through the write lock, so concurrent joins and leaves
/// never lose updates and readers always see a whole table.
pub struct ConnectionRegistry {
    participants: RwLock<HashMap<String, Participant>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            participants: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or replaces by id; last connect wins.
    pub async fn register(&self, mut participant: Participant) -> Registration {
        let mut participants = self.participants.write().await;

        match participants.remove(&participant.id) {
            Some(previous) => {
                participant.joined_at = previous.joined_at;
                info!(
                    participant_id = %participant.id,
                    name = %participant.display_name,
                    previous_connection = previous.connection_id(),
                    connection = participant.connection_id(),
                    "Participant reconnected"
                );
                participants.insert(participant.id.clone(), participant);
                Registration::Reconnected { previous }
            }
            None => {
                info!(
                    participant_id = %participant.id,
                    name = %participant.display_name,
                    kind = %participant.kind,
                    "Participant registered"
                );
                participants.insert(participant.id.clone(), participant);
                Registration::Joined
            }
        }
    }

    /// Removes `id` if present. Absent ids are a no-op.
    pub async fn unregister(&self, id: &str) -> Option<Participant> {
        let removed = self.participants.write().await.remove(id);
        match &removed {
            Some(p) => info!(participant_id = %id, name = %p.display_name, "Participant unregistered"),
            None => debug!(participant_id = %id, "Unregister of absent participant ignored"),
        }
        removed
    }

    /// Removes `id` only while it is still bound to `connection_id`, so a
    /// stale connection closing cannot evict a newer reconnect.
    pub async fn unregister_connection(&self, id: &str, connection_id: u64) -> Option<Participant> {
        let mut participants = self.participants.write().await;

        let owned = participants
            .get(id)
            .map(|p| p.connection_id() == connection_id)
            .unwrap_or(false);

        if !owned {
            debug!(
                participant_id = %id,
                connection = connection_id,
                "Connection no longer owns registry entry; nothing to remove"
            );
            return None;
        }

        let removed = participants.remove(id);
        if let Some(p) = &removed {
            info!(
                participant_id = %id,
                name = %p.display_name,
                connection = connection_id,
                "Participant unregistered"
            );
        }
        removed
    }

    pub async fn lookup(&self, id: &str) -> Option<Participant> {
        self.participants.read().await.get(id).cloned()
    }

    /// Point-in-time copy ordered by join time.
    pub async fn snapshot(&self) -> Vec<Participant> {
        let mut snapshot: Vec<Participant> =
            self.participants.read().await.values().cloned().collect();
        snapshot.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        snapshot
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.participants.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.participants.read().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionHandle, ParticipantKind};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn participant(id: &str, connection_id: u64) -> Participant {
        let (tx, _rx) = mpsc::channel(4);
        Participant::new(id, id.to_uppercase(), ParticipantKind::Human, ConnectionHandle::new(connection_id, tx))
    }

    #[tokio::test]
    async fn test_register_then_lookup() {
        let registry = ConnectionRegistry::new();
        let outcome = registry.register(participant("a", 1)).await;

        assert!(outcome.is_fresh_join());
        assert!(registry.contains("a").await);
        assert_eq!(registry.lookup("a").await.unwrap().display_name, "A");
        assert!(registry.lookup("b").await.is_none());
    }

    #[tokio::test]
    async fn test_reregister_replaces_handle() {
        let registry = ConnectionRegistry::new();
        registry.register(participant("a", 1)).await;
        let outcome = registry.register(participant("a", 2)).await;

        match outcome {
            Registration::Reconnected { previous } => assert_eq!(previous.connection_id(), 1),
            Registration::Joined => panic!("expected reconnect"),
        }
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.lookup("a").await.unwrap().connection_id(), 2);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.register(participant("a", 1)).await;
        registry.register(participant("b", 2)).await;

        assert!(registry.unregister("a").await.is_some());
        assert!(registry.unregister("a").await.is_none());
        assert!(registry.unregister("never").await.is_none());

        let ids: Vec<_> = registry.snapshot().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_evict_reconnect() {
        let registry = ConnectionRegistry::new();
        registry.register(participant("a", 1)).await;
        registry.register(participant("a", 2)).await;

        assert!(registry.unregister_connection("a", 1).await.is_none());
        assert!(registry.contains("a").await);

        assert!(registry.unregister_connection("a", 2).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_join_time() {
        let registry = ConnectionRegistry::new();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            registry.register(participant(id, i as u64)).await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let ids: Vec<_> = registry.snapshot().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_concurrent_registration_keeps_one_entry_per_id() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..50u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("p{}", i % 5);
                registry.register(participant(&id, i)).await;
                if i % 7 == 0 {
                    registry.unregister(&id).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = registry.snapshot().await;
        let mut ids: Vec<_> = snapshot.iter().map(|p| p.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), snapshot.len());
        assert!(snapshot.len() <= 5);
    }
}
