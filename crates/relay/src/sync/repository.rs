// Document repository: document lookup/creation, presence bookkeeping, and
// delivery of presence deltas from the bus to local listeners.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::StreamExt;
use quire_common::protocol::presence::{
    active_users_update_topic, is_document_topic, PresenceDelta, DOC_TOPIC_PATTERN,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    doc_set::{DocSet, Document},
    peer::PeerRegistry,
};
use crate::{
    config::RelayConfig,
    presence::{BusMessage, BusStream, PresenceBackend, PresenceError},
};

pub const SAMPLE_DOC_ID: &str = "1";
pub const MAX_DOC_ID_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid document id: {reason}")]
    InvalidId { reason: &'static str },
}

pub type PresenceListener = Arc<dyn Fn(&PresenceDelta) + Send + Sync>;

type ListenerMap = RwLock<HashMap<u64, PresenceListener>>;

/// Handle returned by [`DocumentRepository::add_presence_listener`]. The
/// listener stays registered until the handle is unsubscribed or dropped.
pub struct PresenceSubscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl PresenceSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
        }
    }
}

pub struct DocumentRepository {
    docs: Arc<DocSet>,
    peer_registry: Arc<dyn PeerRegistry>,
    presence: PresenceBackend,
    presence_ttl: Duration,
    listeners: Arc<ListenerMap>,
    next_listener_id: AtomicU64,
    bus_task: JoinHandle<()>,
}

impl DocumentRepository {
    /// Builds the repository and subscribes once to the presence bus.
    pub async fn start(
        presence: PresenceBackend,
        config: &RelayConfig,
    ) -> Result<Arc<Self>, PresenceError> {
        let docs = Arc::new(DocSet::default());
        let registry: Arc<dyn PeerRegistry> = docs.clone();
        Self::start_with_registry(presence, config, docs, registry).await
    }

    /// Like [`DocumentRepository::start`] but with a caller-supplied peer
    /// registry in front of the document set.
    pub async fn start_with_registry(
        presence: PresenceBackend,
        config: &RelayConfig,
        docs: Arc<DocSet>,
        peer_registry: Arc<dyn PeerRegistry>,
    ) -> Result<Arc<Self>, PresenceError> {
        if config.seed_sample_doc && docs.get(SAMPLE_DOC_ID).is_none() {
            docs.insert(Document::with_sample_text(SAMPLE_DOC_ID));
            debug!(doc_id = SAMPLE_DOC_ID, "seeded sample document");
        }

        let listeners: Arc<ListenerMap> = Arc::new(RwLock::new(HashMap::new()));
        let bus = presence.subscribe(DOC_TOPIC_PATTERN).await?;
        let bus_task = tokio::spawn(dispatch_bus_messages(bus, Arc::downgrade(&listeners)));
        info!(backend = presence.kind(), pattern = DOC_TOPIC_PATTERN, "subscribed to presence bus");

        Ok(Arc::new(Self {
            docs,
            peer_registry,
            presence,
            presence_ttl: config.presence_ttl,
            listeners,
            next_listener_id: AtomicU64::new(1),
            bus_task,
        }))
    }

    pub fn get_doc(&self, doc_id: &str) -> Option<Arc<Document>> {
        self.docs.get(doc_id)
    }

    pub fn get_or_create_doc(&self, doc_id: &str) -> Result<Arc<Document>, DocumentError> {
        validate_doc_id(doc_id)?;
        Ok(self.docs.get_or_create(doc_id))
    }

    /// Base64 of the document's full yrs v1 state.
    pub fn serialize_doc(&self, document: &Document) -> String {
        STANDARD.encode(document.encode_state())
    }

    pub fn peer_registry(&self) -> Arc<dyn PeerRegistry> {
        Arc::clone(&self.peer_registry)
    }

    pub fn presence_ttl(&self) -> Duration {
        self.presence_ttl
    }

    /// Records `agent_id` as active on `doc_id` and publishes the delta.
    pub async fn join_document(
        &self,
        doc_id: &str,
        agent_id: &str,
    ) -> Result<PresenceDelta, PresenceError> {
        let delta = self.presence.join(doc_id, agent_id, self.presence_ttl).await?;
        self.publish(&delta).await?;
        debug!(
            doc_id = %doc_id,
            agent_id = %agent_id,
            active = delta.active_ids.len(),
            "agent joined document"
        );
        Ok(delta)
    }

    pub async fn leave_document(
        &self,
        doc_id: &str,
        agent_id: &str,
    ) -> Result<PresenceDelta, PresenceError> {
        let delta = self.presence.leave(doc_id, agent_id).await?;
        self.publish(&delta).await?;
        debug!(
            doc_id = %doc_id,
            agent_id = %agent_id,
            active = delta.active_ids.len(),
            "agent left document"
        );
        Ok(delta)
    }

    /// Extends an existing presence entry without publishing.
    pub async fn refresh_presence(
        &self,
        doc_id: &str,
        agent_id: &str,
    ) -> Result<bool, PresenceError> {
        self.presence.refresh(doc_id, agent_id, self.presence_ttl).await
    }

    pub async fn active_users(&self, doc_id: &str) -> Result<BTreeSet<String>, PresenceError> {
        self.presence.members(doc_id).await
    }

    /// Registers a callback for every presence delta received from the bus,
    /// including deltas this node published.
    pub fn add_presence_listener<F>(&self, listener: F) -> PresenceSubscription
    where
        F: Fn(&PresenceDelta) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        PresenceSubscription { id, listeners: Arc::downgrade(&self.listeners) }
    }

    pub fn presence_listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn publish(&self, delta: &PresenceDelta) -> Result<(), PresenceError> {
        let payload = serde_json::to_string(delta)?;
        self.presence.publish(&active_users_update_topic(&delta.doc_id), payload).await
    }
}

impl Drop for DocumentRepository {
    fn drop(&mut self) {
        self.bus_task.abort();
    }
}

pub fn validate_doc_id(doc_id: &str) -> Result<(), DocumentError> {
    if doc_id.is_empty() {
        return Err(DocumentError::InvalidId { reason: "empty" });
    }
    if doc_id.len() > MAX_DOC_ID_BYTES {
        return Err(DocumentError::InvalidId { reason: "longer than 256 bytes" });
    }
    Ok(())
}

async fn dispatch_bus_messages(mut bus: BusStream, listeners: Weak<ListenerMap>) {
    while let Some(message) = bus.next().await {
        let Some(listeners) = listeners.upgrade() else {
            break;
        };
        let Some(delta) = parse_bus_message(&message) else {
            continue;
        };

        let snapshot: Vec<PresenceListener> =
            listeners.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        for listener in snapshot {
            listener(&delta);
        }
    }
    debug!("presence bus stream ended");
}

fn parse_bus_message(message: &BusMessage) -> Option<PresenceDelta> {
    if !is_document_topic(&message.topic) {
        return None;
    }
    match serde_json::from_str::<PresenceDelta>(&message.payload) {
        Ok(delta) => Some(delta),
        Err(error) => {
            warn!(topic = %message.topic, error = %error, "skipping malformed presence bus message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    async fn repository() -> Arc<DocumentRepository> {
        DocumentRepository::start(PresenceBackend::memory(), &RelayConfig::for_tests())
            .await
            .expect("memory repository should start")
    }

    fn recorder(
        repo: &DocumentRepository,
    ) -> (PresenceSubscription, Arc<Mutex<Vec<PresenceDelta>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = repo.add_presence_listener(move |delta: &PresenceDelta| {
            sink.lock().unwrap().push(delta.clone());
        });
        (subscription, seen)
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<PresenceDelta>>>, count: usize) -> Vec<PresenceDelta> {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn sample_document_is_seeded() {
        let repo = repository().await;
        let doc = repo.get_doc(SAMPLE_DOC_ID).expect("sample doc should exist");
        assert!(doc.text().starts_with("Lorem ipsum"));
        assert!(repo.get_doc("missing").is_none());
    }

    #[tokio::test]
    async fn seeding_can_be_disabled() {
        let config = RelayConfig { seed_sample_doc: false, ..RelayConfig::for_tests() };
        let repo = DocumentRepository::start(PresenceBackend::memory(), &config).await.unwrap();
        assert!(repo.get_doc(SAMPLE_DOC_ID).is_none());
    }

    #[tokio::test]
    async fn get_or_create_validates_ids() {
        let repo = repository().await;
        assert!(repo.get_or_create_doc("fresh").is_ok());
        assert!(repo.get_doc("fresh").is_some());
        assert!(matches!(repo.get_or_create_doc(""), Err(DocumentError::InvalidId { .. })));
        let long = "x".repeat(MAX_DOC_ID_BYTES + 1);
        assert!(repo.get_or_create_doc(&long).is_err());
        assert!(repo.get_or_create_doc(&"x".repeat(MAX_DOC_ID_BYTES)).is_ok());
    }

    #[tokio::test]
    async fn serialized_document_restores_text() {
        let repo = repository().await;
        let doc = repo.get_doc(SAMPLE_DOC_ID).unwrap();
        let serialized = repo.serialize_doc(&doc);

        let restored = Document::new("copy");
        restored.apply_update(&STANDARD.decode(serialized).unwrap()).unwrap();
        assert_eq!(restored.text(), doc.text());
    }

    #[tokio::test]
    async fn join_and_leave_publish_consistent_deltas_to_listeners() {
        let repo = repository().await;
        let (_subscription, seen) = recorder(&repo);

        repo.join_document("1", "a1").await.unwrap();
        repo.join_document("1", "b1").await.unwrap();
        repo.leave_document("1", "b1").await.unwrap();

        let deltas = wait_for(&seen, 3).await;
        assert_eq!(deltas.len(), 3);
        assert!(deltas.iter().all(PresenceDelta::is_consistent));
        assert_eq!(deltas[1].added_ids, vec!["b1"]);
        assert_eq!(deltas[1].active_ids, vec!["a1", "b1"]);
        assert_eq!(deltas[2].removed_ids, vec!["b1"]);
        assert_eq!(deltas[2].active_ids, vec!["a1"]);
        assert_eq!(repo.active_users("1").await.unwrap(), BTreeSet::from(["a1".to_string()]));
    }

    #[tokio::test]
    async fn malformed_and_foreign_bus_messages_are_skipped() {
        let backend = PresenceBackend::memory();
        let repo =
            DocumentRepository::start(backend.clone(), &RelayConfig::for_tests()).await.unwrap();
        let (_subscription, seen) = recorder(&repo);

        backend.publish("doc:1:_state:active-users:update", "not json".into()).await.unwrap();
        backend.publish("workspace:1", "{}".into()).await.unwrap();
        repo.join_document("1", "a1").await.unwrap();

        let deltas = wait_for(&seen, 1).await;
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].added_ids, vec!["a1"]);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let repo = repository().await;
        let (subscription, seen) = recorder(&repo);
        assert_eq!(repo.presence_listener_count(), 1);

        subscription.unsubscribe();
        assert_eq!(repo.presence_listener_count(), 0);

        repo.join_document("1", "a1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repositories_sharing_a_backend_see_each_others_deltas() {
        let backend = PresenceBackend::memory();
        let node_a =
            DocumentRepository::start(backend.clone(), &RelayConfig::for_tests()).await.unwrap();
        let node_b = DocumentRepository::start(backend, &RelayConfig::for_tests()).await.unwrap();
        let (_subscription, seen_by_b) = recorder(&node_b);

        node_a.join_document("1", "a1").await.unwrap();

        let deltas = wait_for(&seen_by_b, 1).await;
        assert_eq!(deltas[0].active_ids, vec!["a1"]);
        assert_eq!(node_b.active_users("1").await.unwrap().len(), 1);
    }
}
