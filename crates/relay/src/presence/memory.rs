use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use futures_util::{stream, StreamExt};
use quire_common::protocol::presence::PresenceDelta;
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tracing::warn;

use super::{topic_matches, BusMessage, BusStream};

const BUS_CAPACITY: usize = 1024;

/// In-process presence store and bus.
///
/// Deadlines use tokio's clock so tests can drive expiry with paused time.
#[derive(Debug, Clone)]
pub struct MemoryPresence {
    sets: Arc<Mutex<HashMap<String, HashMap<String, Instant>>>>,
    bus: broadcast::Sender<BusMessage>,
}

impl Default for MemoryPresence {
    fn default() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self { sets: Arc::new(Mutex::new(HashMap::new())), bus }
    }
}

impl MemoryPresence {
    pub async fn join(&self, doc_id: &str, agent_id: &str, ttl: Duration) -> PresenceDelta {
        let now = Instant::now();
        let mut sets = self.sets.lock().await;
        let members = sets.entry(doc_id.to_owned()).or_default();
        let before = ids(members);
        members.retain(|_, deadline| *deadline > now);
        members.insert(agent_id.to_owned(), now + ttl);
        PresenceDelta::between(doc_id, &before, &ids(members))
    }

    pub async fn leave(&self, doc_id: &str, agent_id: &str) -> PresenceDelta {
        let now = Instant::now();
        let mut sets = self.sets.lock().await;
        let Some(members) = sets.get_mut(doc_id) else {
            return PresenceDelta::between(doc_id, &BTreeSet::new(), &BTreeSet::new());
        };
        let before = ids(members);
        members.retain(|_, deadline| *deadline > now);
        members.remove(agent_id);
        let delta = PresenceDelta::between(doc_id, &before, &ids(members));
        if members.is_empty() {
            sets.remove(doc_id);
        }
        delta
    }

    pub async fn refresh(&self, doc_id: &str, agent_id: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut sets = self.sets.lock().await;
        match sets.get_mut(doc_id).and_then(|members| members.get_mut(agent_id)) {
            Some(deadline) if *deadline > now => {
                *deadline = now + ttl;
                true
            }
            _ => false,
        }
    }

    pub async fn members(&self, doc_id: &str) -> BTreeSet<String> {
        let now = Instant::now();
        let mut sets = self.sets.lock().await;
        let Some(members) = sets.get_mut(doc_id) else {
            return BTreeSet::new();
        };
        members.retain(|_, deadline| *deadline > now);
        let current = ids(members);
        if members.is_empty() {
            sets.remove(doc_id);
        }
        current
    }

    pub fn publish(&self, topic: &str, payload: String) {
        // No subscribers is not an error; the message is simply dropped.
        let _ = self.bus.send(BusMessage { topic: topic.to_owned(), payload });
    }

    pub fn subscribe(&self, pattern: &str) -> BusStream {
        let pattern = pattern.to_owned();
        stream::unfold(self.bus.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence bus subscriber lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| std::future::ready(topic_matches(&pattern, &message.topic)))
        .boxed()
    }
}

fn ids(members: &HashMap<String, Instant>) -> BTreeSet<String> {
    members.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn join_then_leave_restores_membership() {
        let store = MemoryPresence::default();
        store.join("1", "a1", TTL).await;
        let before = store.members("1").await;

        let joined = store.join("1", "b1", TTL).await;
        assert_eq!(joined.added_ids, vec!["b1"]);
        assert_eq!(joined.active_ids, vec!["a1", "b1"]);
        assert!(joined.is_consistent());

        let left = store.leave("1", "b1").await;
        assert_eq!(left.removed_ids, vec!["b1"]);
        assert!(left.is_consistent());
        assert_eq!(store.members("1").await, before);
    }

    #[tokio::test]
    async fn leave_of_unknown_document_is_empty_delta() {
        let store = MemoryPresence::default();
        let delta = store.leave("missing", "a1").await;
        assert!(delta.is_noop());
        assert!(delta.active_ids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn members_expire_after_ttl() {
        let store = MemoryPresence::default();
        store.join("1", "a1", TTL).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        store.join("1", "b1", TTL).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.members("1").await, set(&["b1"]));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.members("1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_members_surface_as_removals_on_next_join() {
        let store = MemoryPresence::default();
        store.join("1", "a1", TTL).await;
        store.join("1", "b1", Duration::from_secs(5)).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let delta = store.join("1", "a1", TTL).await;
        assert_eq!(delta.removed_ids, vec!["b1"]);
        assert_eq!(delta.active_ids, vec!["a1"]);
        assert!(delta.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_only_live_members() {
        let store = MemoryPresence::default();
        store.join("1", "a1", TTL).await;
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(store.refresh("1", "a1", TTL).await);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(store.members("1").await, set(&["a1"]));

        assert!(!store.refresh("1", "ghost", TTL).await);
        assert_eq!(store.members("1").await, set(&["a1"]));
    }

    #[tokio::test]
    async fn bus_delivers_matching_topics_to_every_subscriber() {
        let store = MemoryPresence::default();
        let mut first = store.subscribe("doc:*");
        let mut second = store.clone().subscribe("doc:*");

        store.publish("other:1", "ignored".into());
        store.publish("doc:1:_state:active-users:update", "{}".into());

        for subscriber in [&mut first, &mut second] {
            let message = subscriber.next().await.expect("subscriber should receive message");
            assert_eq!(message.topic, "doc:1:_state:active-users:update");
            assert_eq!(message.payload, "{}");
        }
    }

    #[tokio::test]
    async fn clones_share_presence_state() {
        let node_a = MemoryPresence::default();
        let node_b = node_a.clone();
        node_a.join("1", "a1", TTL).await;
        node_b.join("1", "b1", TTL).await;
        assert_eq!(node_a.members("1").await, set(&["a1", "b1"]));
    }
}
