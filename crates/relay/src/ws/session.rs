// Per-connection state and frame dispatch.
//
// A `ConnectionSession` is owned by exactly one connection task and never
// touches the socket itself: every handler returns the frames to write and,
// when the connection must end, the close code to send.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use quire_common::protocol::ws::{
    decode_client_frame, ClientMessage, FrameError, InboundFrame, Selection, ServerMessage,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::node::{ConnectionId, OutboundSender, RelayNode};
use crate::sync::peer::{LocalUpdateSender, PeerError, PeerKey};

pub(crate) const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Why the relay is ending a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub code: u16,
    pub reason: &'static str,
}

impl Termination {
    const PEER_FAILURE: Self = Self { code: CLOSE_INTERNAL_ERROR, reason: "peer session failed" };
}

/// Frames to write in order, then optionally close.
#[derive(Debug, Default, PartialEq)]
pub struct Reply {
    pub frames: Vec<ServerMessage>,
    pub terminate: Option<Termination>,
}

impl Reply {
    fn frame(message: ServerMessage) -> Self {
        Self { frames: vec![message], terminate: None }
    }

    fn terminate(termination: Termination) -> Self {
        Self { frames: Vec::new(), terminate: Some(termination) }
    }
}

/// Mutable facts about one connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Set once the first inbound frame has been seen.
    pub initialized: bool,
    /// Agent confirmed by the most recent successful join.
    pub agent_id: Option<String>,
    /// Flips after the first deferred delivery window elapses.
    pub peer_channel_open: bool,
    /// Joins in flight, doc id to agent id.
    pub subscribing: BTreeMap<String, String>,
    /// Joined documents, doc id to the agent that joined each.
    pub subscribed: BTreeMap<String, String>,
}

#[derive(Debug)]
struct HeldUpdate {
    key: PeerKey,
    message: Value,
}

pub struct ConnectionSession {
    id: ConnectionId,
    node: Arc<RelayNode>,
    updates: LocalUpdateSender,
    state: ConnectionState,
    held: VecDeque<HeldUpdate>,
    deferred_until: Option<Instant>,
    torn_down: bool,
}

impl ConnectionSession {
    /// Registers a new connection on `node`. `outbound` receives frames other
    /// tasks address to this connection; `updates` is handed to every peer
    /// session the connection opens.
    pub fn open(node: Arc<RelayNode>, outbound: OutboundSender, updates: LocalUpdateSender) -> Self {
        let id = Uuid::new_v4();
        node.register_connection(id, outbound);
        info!(
            node_id = %node.id(),
            connection_id = %id,
            connections = node.connection_count(),
            "websocket connection accepted"
        );
        Self {
            id,
            node,
            updates,
            state: ConnectionState::default(),
            held: VecDeque::new(),
            deferred_until: None,
            torn_down: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn held_update_count(&self) -> usize {
        self.held.len()
    }

    /// Marks the connection initialized. Returns `true` only for the first
    /// inbound frame, which is when keepalives start.
    pub fn mark_initialized(&mut self) -> bool {
        !std::mem::replace(&mut self.state.initialized, true)
    }

    /// When the current deferred delivery window closes, if one is running.
    pub fn deferred_deadline(&self) -> Option<Instant> {
        self.deferred_until
    }

    pub async fn handle_text(&mut self, raw: &str) -> Reply {
        let metrics = Arc::clone(self.node.metrics());
        match decode_client_frame(raw) {
            Ok(InboundFrame::Message(message)) => {
                metrics.record_ws_frame(message.message_type());
                self.handle_message(message).await
            }
            Ok(InboundFrame::Unknown { message_type }) => {
                debug!(
                    connection_id = %self.id,
                    message_type = %message_type,
                    "ignoring unknown frame type"
                );
                metrics.record_ws_frame_error(&message_type);
                Reply::default()
            }
            Err(FrameError::InvalidPayload { message_type, source }) => {
                warn!(
                    connection_id = %self.id,
                    message_type = %message_type,
                    error = %source,
                    "dropping frame with invalid payload"
                );
                metrics.record_ws_frame_error(&message_type);
                Reply::default()
            }
            Err(error) => {
                warn!(connection_id = %self.id, error = %error, "dropping malformed frame");
                metrics.record_ws_frame_error("malformed");
                Reply::default()
            }
        }
    }

    /// The protocol is JSON text only.
    pub fn handle_binary(&self) {
        debug!(connection_id = %self.id, "ignoring binary frame");
        self.node.metrics().record_ws_frame_error("binary");
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Reply {
        match message {
            ClientMessage::JoinDocument { client_id, doc_id } => self.join(doc_id, client_id).await,
            ClientMessage::LeaveDocument { client_id, doc_id, agent_id } => {
                self.leave(doc_id, client_id, agent_id).await
            }
            ClientMessage::AutomergeConnectionSend { client_id, doc_id, message } => {
                let agent_id = self.state.agent_id.clone().unwrap_or(client_id);
                self.sync(PeerKey::new(doc_id, agent_id), message)
            }
            ClientMessage::RemoteAgentSetselection { client_id, doc_id, message } => {
                self.set_selection(client_id, doc_id, message);
                Reply::default()
            }
        }
    }

    async fn join(&mut self, doc_id: String, client_id: String) -> Reply {
        self.state.subscribing.insert(doc_id.clone(), client_id.clone());

        let repository = Arc::clone(self.node.repository());
        if let Err(error) = repository.get_or_create_doc(&doc_id) {
            warn!(connection_id = %self.id, doc_id = %doc_id, error = %error, "join rejected");
            self.state.subscribing.remove(&doc_id);
            self.node.metrics().record_ws_frame_error("join-document");
            return Reply::default();
        }

        if let Err(error) = repository.join_document(&doc_id, &client_id).await {
            warn!(
                connection_id = %self.id,
                doc_id = %doc_id,
                agent_id = %client_id,
                error = %error,
                "failed to record presence on join"
            );
            self.node.metrics().increment_presence_store_failures();
        }

        self.state.subscribing.remove(&doc_id);
        self.state.subscribed.insert(doc_id.clone(), client_id.clone());
        self.state.agent_id = Some(client_id.clone());

        let mut reply = Reply::frame(ServerMessage::JoinDocumentSuccess {
            doc_id: doc_id.clone(),
            client_id: client_id.clone(),
            agent_id: client_id.clone(),
        });

        let key = PeerKey::new(doc_id, client_id);
        if let Err(error) = self.node.open_peer(self.id, key.clone(), self.updates.clone()) {
            reply.terminate = Some(self.peer_failed(&key, &error));
        }
        reply
    }

    async fn leave(&mut self, doc_id: String, client_id: String, agent_id: Option<String>) -> Reply {
        let joined_as = self
            .state
            .subscribed
            .remove(&doc_id)
            .or_else(|| self.state.subscribing.remove(&doc_id));
        self.state.subscribing.remove(&doc_id);
        let agent_id = agent_id
            .or(joined_as)
            .or_else(|| self.state.agent_id.clone())
            .unwrap_or_else(|| client_id.clone());
        self.node.close_peer(self.id, &PeerKey::new(doc_id.clone(), agent_id.clone()));

        if let Err(error) = self.node.repository().leave_document(&doc_id, &agent_id).await {
            warn!(
                connection_id = %self.id,
                doc_id = %doc_id,
                agent_id = %agent_id,
                error = %error,
                "failed to record presence on leave"
            );
            self.node.metrics().increment_presence_store_failures();
        }

        Reply::frame(ServerMessage::LeaveDocumentSuccess { doc_id, client_id, agent_id })
    }

    fn sync(&mut self, key: PeerKey, message: Value) -> Reply {
        if self.state.peer_channel_open {
            return self.deliver(&key, &message);
        }

        self.held.push_back(HeldUpdate { key, message });
        if self.deferred_until.is_none() {
            self.deferred_until = Some(Instant::now() + self.node.config().update_retry_delay);
        }
        Reply::default()
    }

    /// Ends the deferred delivery window: the peer channel is marked
    /// connected and held updates are delivered once each, oldest first.
    pub fn flush_held_updates(&mut self) -> Reply {
        self.deferred_until = None;
        self.state.peer_channel_open = true;

        while let Some(HeldUpdate { key, message }) = self.held.pop_front() {
            let reply = self.deliver(&key, &message);
            if reply.terminate.is_some() {
                self.held.clear();
                return reply;
            }
        }
        Reply::default()
    }

    fn deliver(&mut self, key: &PeerKey, message: &Value) -> Reply {
        match self.node.deliver_to_peer(self.id, key, message) {
            Ok(true) => Reply::default(),
            Ok(false) => {
                debug!(connection_id = %self.id, peer = %key, "no peer session for sync message");
                self.node.metrics().record_ws_frame_error("automerge-connection-send");
                Reply::default()
            }
            Err(error) => Reply::terminate(self.peer_failed(key, &error)),
        }
    }

    fn peer_failed(&mut self, key: &PeerKey, error: &PeerError) -> Termination {
        warn!(connection_id = %self.id, peer = %key, error = %error, "peer session failed");
        self.node.metrics().increment_peer_adapter_failures();
        self.node.close_peer(self.id, key);
        Termination::PEER_FAILURE
    }

    fn set_selection(&self, client_id: String, doc_id: String, selection: Selection) {
        if self.state.agent_id.is_none() {
            debug!(connection_id = %self.id, "dropping selection from connection with no agent");
            return;
        }
        self.node.broadcast(&ServerMessage::RemoteAgentSetselectionFromServer {
            client_id,
            doc_id,
            message: selection,
        });
    }

    /// Extends this connection's presence on every subscribed document.
    pub async fn refresh_presence(&self) {
        for (doc_id, agent_id) in &self.state.subscribed {
            match self.node.repository().refresh_presence(doc_id, agent_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(doc_id = %doc_id, agent_id = %agent_id, "presence entry already expired");
                }
                Err(error) => {
                    warn!(doc_id = %doc_id, agent_id = %agent_id, error = %error, "presence refresh failed");
                    self.node.metrics().increment_presence_store_failures();
                }
            }
        }
    }

    /// Releases everything the connection holds. Only the first call does
    /// any work; returns whether this call did.
    pub async fn teardown(&mut self) -> bool {
        if std::mem::replace(&mut self.torn_down, true) {
            return false;
        }

        self.held.clear();
        self.deferred_until = None;
        let closed_peers = self.node.close_peers_owned_by(self.id);

        let mut docs = std::mem::take(&mut self.state.subscribing);
        docs.append(&mut self.state.subscribed);
        for (doc_id, agent_id) in &docs {
            // A newer connection for the same agent took this document over
            // and still holds the presence entry.
            let key = PeerKey::new(doc_id.as_str(), agent_id.as_str());
            if self.node.peer_owner(&key).is_some_and(|owner| owner != self.id) {
                continue;
            }
            if let Err(error) = self.node.repository().leave_document(doc_id, agent_id).await {
                warn!(
                    connection_id = %self.id,
                    doc_id = %doc_id,
                    agent_id = %agent_id,
                    error = %error,
                    "failed to clear presence on disconnect"
                );
                self.node.metrics().increment_presence_store_failures();
            }
        }

        self.node.deregister_connection(self.id);
        info!(
            node_id = %self.node.id(),
            connection_id = %self.id,
            closed_peers,
            left_docs = docs.len(),
            connections = self.node.connection_count(),
            "websocket connection closed"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use quire_common::protocol::ws::SelectionMark;
    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::{
        config::RelayConfig,
        metrics::RelayMetrics,
        presence::PresenceBackend,
        sync::{
            doc_set::DocSet,
            peer::{LocalUpdate, PeerAdapter, PeerRegistry},
            repository::DocumentRepository,
        },
    };

    #[derive(Default)]
    struct Journal {
        received: Vec<(PeerKey, Value)>,
        opened: usize,
        closed: usize,
    }

    /// Records what the relay hands to peer sessions. Messages carrying
    /// `"fail": true` make the session error.
    #[derive(Default)]
    struct RecordingRegistry {
        journal: Arc<Mutex<Journal>>,
    }

    struct RecordingPeer {
        key: PeerKey,
        journal: Arc<Mutex<Journal>>,
        open: bool,
    }

    impl PeerRegistry for RecordingRegistry {
        fn attach(
            self: Arc<Self>,
            key: PeerKey,
            _updates: mpsc::UnboundedSender<LocalUpdate>,
        ) -> Box<dyn PeerAdapter> {
            Box::new(RecordingPeer { key, journal: Arc::clone(&self.journal), open: false })
        }
    }

    impl PeerAdapter for RecordingPeer {
        fn key(&self) -> &PeerKey {
            &self.key
        }

        fn open(&mut self) -> Result<(), PeerError> {
            self.open = true;
            self.journal.lock().unwrap().opened += 1;
            Ok(())
        }

        fn receive_remote_update(&mut self, message: &Value) -> Result<(), PeerError> {
            if message.get("fail").is_some() {
                return Err(PeerError::Apply("rejected".into()));
            }
            self.journal.lock().unwrap().received.push((self.key.clone(), message.clone()));
            Ok(())
        }

        fn close(&mut self) -> Result<(), PeerError> {
            if !self.open {
                return Err(PeerError::Closed(self.key.clone()));
            }
            self.open = false;
            self.journal.lock().unwrap().closed += 1;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    struct Harness {
        node: Arc<RelayNode>,
        journal: Arc<Mutex<Journal>>,
    }

    impl Harness {
        async fn new() -> Self {
            let config = RelayConfig::for_tests();
            let registry = Arc::new(RecordingRegistry::default());
            let journal = Arc::clone(&registry.journal);
            let repository = DocumentRepository::start_with_registry(
                PresenceBackend::memory(),
                &config,
                Arc::new(DocSet::default()),
                registry,
            )
            .await
            .expect("memory repository should start");
            let node = RelayNode::new(config, repository, Arc::new(RelayMetrics::default()));
            Self { node, journal }
        }

        fn connect(&self) -> (ConnectionSession, UnboundedReceiver<ServerMessage>) {
            let (outbound, receiver) = mpsc::unbounded_channel();
            let (updates, _) = mpsc::unbounded_channel();
            (ConnectionSession::open(Arc::clone(&self.node), outbound, updates), receiver)
        }

        async fn members(&self, doc_id: &str) -> BTreeSet<String> {
            self.node.repository().active_users(doc_id).await.unwrap()
        }

        fn received(&self) -> Vec<Value> {
            self.journal.lock().unwrap().received.iter().map(|(_, m)| m.clone()).collect()
        }
    }

    fn join(doc_id: &str, client_id: &str) -> ClientMessage {
        ClientMessage::JoinDocument { client_id: client_id.into(), doc_id: doc_id.into() }
    }

    fn sync(doc_id: &str, client_id: &str, message: Value) -> ClientMessage {
        ClientMessage::AutomergeConnectionSend {
            client_id: client_id.into(),
            doc_id: doc_id.into(),
            message,
        }
    }

    fn selection() -> Selection {
        Selection {
            anchor: json!({ "path": [0, 0], "offset": 1 }),
            focus: json!({ "path": [0, 0], "offset": 4 }),
            mark: SelectionMark { kind: "remote-agent-cursor".into() },
        }
    }

    #[tokio::test]
    async fn only_the_first_frame_initializes() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();
        assert!(session.mark_initialized());
        assert!(!session.mark_initialized());
        assert!(session.state().initialized);
    }

    #[tokio::test]
    async fn join_acknowledges_and_records_presence() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();

        let reply = session.handle_message(join("1", "a1")).await;

        assert_eq!(
            reply,
            Reply::frame(ServerMessage::JoinDocumentSuccess {
                doc_id: "1".into(),
                client_id: "a1".into(),
                agent_id: "a1".into(),
            })
        );
        assert_eq!(session.state().agent_id.as_deref(), Some("a1"));
        assert_eq!(session.state().subscribed.get("1").map(String::as_str), Some("a1"));
        assert!(session.state().subscribing.is_empty());
        assert_eq!(harness.members("1").await, BTreeSet::from(["a1".to_string()]));
        assert_eq!(harness.node.peer_owner(&PeerKey::new("1", "a1")), Some(session.id()));
    }

    #[tokio::test]
    async fn rejected_join_sends_no_ack() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();

        let reply = session.handle_message(join("", "a1")).await;

        assert_eq!(reply, Reply::default());
        assert!(session.state().subscribing.is_empty());
        assert!(session.state().subscribed.is_empty());
        assert_eq!(session.state().agent_id, None);
        assert_eq!(harness.node.peer_session_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_join_re_acknowledges_without_a_second_session() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();

        session.handle_message(join("1", "a1")).await;
        let reply = session.handle_message(join("1", "a1")).await;

        assert_eq!(reply.frames.len(), 1);
        assert_eq!(harness.journal.lock().unwrap().opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn held_updates_are_delivered_once_in_order_after_the_window() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();
        session.handle_message(join("1", "a1")).await;

        for seq in 0..3 {
            let reply = session.handle_message(sync("1", "a1", json!({ "seq": seq }))).await;
            assert_eq!(reply, Reply::default());
        }
        assert_eq!(session.held_update_count(), 3);
        assert!(harness.received().is_empty());

        let deadline = session.deferred_deadline().expect("window should be running");
        assert_eq!(deadline - Instant::now(), Duration::from_secs(1));
        tokio::time::sleep_until(deadline).await;
        assert_eq!(session.flush_held_updates(), Reply::default());

        assert_eq!(harness.received(), vec![json!({"seq": 0}), json!({"seq": 1}), json!({"seq": 2})]);
        assert!(session.state().peer_channel_open);
        assert_eq!(session.deferred_deadline(), None);

        session.handle_message(sync("1", "a1", json!({ "seq": 3 }))).await;
        assert_eq!(harness.received().len(), 4);
        assert_eq!(session.flush_held_updates(), Reply::default());
        assert_eq!(harness.received().len(), 4);
    }

    #[tokio::test]
    async fn sync_without_a_session_is_dropped() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();
        session.handle_message(sync("1", "ghost", json!({}))).await;

        assert_eq!(session.flush_held_updates(), Reply::default());
        assert!(harness.received().is_empty());
        assert_eq!(harness.node.metrics().ws_frame_errors("automerge-connection-send"), 1);
    }

    #[tokio::test]
    async fn peer_failure_closes_the_session_and_terminates() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();
        session.handle_message(join("1", "a1")).await;
        session.flush_held_updates();

        let reply = session.handle_message(sync("1", "a1", json!({ "fail": true }))).await;

        assert_eq!(reply.terminate, Some(Termination::PEER_FAILURE));
        assert_eq!(reply.terminate.map(|t| t.code), Some(1011));
        assert_eq!(harness.node.peer_session_count(), 0);
        assert_eq!(harness.journal.lock().unwrap().closed, 1);

        session.teardown().await;
        assert_eq!(harness.journal.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn selection_requires_a_confirmed_agent_and_reaches_every_connection() {
        let harness = Harness::new().await;
        let (mut sender, mut sender_rx) = harness.connect();
        let (_other, mut other_rx) = harness.connect();

        let select = ClientMessage::RemoteAgentSetselection {
            client_id: "a1".into(),
            doc_id: "1".into(),
            message: selection(),
        };
        sender.handle_message(select.clone()).await;
        assert!(sender_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());

        sender.handle_message(join("1", "a1")).await;
        sender.handle_message(select).await;

        let expected = ServerMessage::RemoteAgentSetselectionFromServer {
            client_id: "a1".into(),
            doc_id: "1".into(),
            message: selection(),
        };
        for rx in [&mut sender_rx, &mut other_rx] {
            let forwarded = std::iter::from_fn(|| rx.try_recv().ok())
                .find(|message| message.message_type() == "remote-agent-setselection-from-server");
            assert_eq!(forwarded, Some(expected.clone()));
        }
    }

    #[tokio::test]
    async fn join_then_leave_restores_presence() {
        let harness = Harness::new().await;
        let (mut first, _r1) = harness.connect();
        let (mut second, _r2) = harness.connect();
        first.handle_message(join("1", "a1")).await;
        let before = harness.members("1").await;

        second.handle_message(join("1", "b1")).await;
        let reply = second
            .handle_message(ClientMessage::LeaveDocument {
                client_id: "b1".into(),
                doc_id: "1".into(),
                agent_id: None,
            })
            .await;

        assert_eq!(
            reply,
            Reply::frame(ServerMessage::LeaveDocumentSuccess {
                doc_id: "1".into(),
                client_id: "b1".into(),
                agent_id: "b1".into(),
            })
        );
        assert_eq!(harness.members("1").await, before);
        assert!(second.state().subscribed.is_empty());
        assert_eq!(harness.node.peer_owner(&PeerKey::new("1", "b1")), None);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let harness = Harness::new().await;
        let (mut first, _r1) = harness.connect();
        let (mut second, _r2) = harness.connect();
        first.handle_message(join("1", "a1")).await;
        second.handle_message(join("1", "b1")).await;
        second.handle_message(join("2", "b1")).await;

        assert!(second.teardown().await);
        assert!(!second.teardown().await);

        assert_eq!(harness.members("1").await, BTreeSet::from(["a1".to_string()]));
        assert!(harness.members("2").await.is_empty());
        assert_eq!(harness.journal.lock().unwrap().closed, 2);
        assert_eq!(harness.node.connection_count(), 1);
        assert_eq!(harness.node.metrics().ws_connections(), 1);
        assert_eq!(harness.node.metrics().peer_sessions_open(), 1);
    }

    #[tokio::test]
    async fn teardown_clears_each_document_under_the_agent_that_joined_it() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();
        session.handle_message(join("1", "a1")).await;
        session.handle_message(join("2", "b1")).await;
        assert_eq!(session.state().agent_id.as_deref(), Some("b1"));

        session.teardown().await;

        assert!(harness.members("1").await.is_empty());
        assert!(harness.members("2").await.is_empty());
        assert_eq!(harness.node.peer_session_count(), 0);
    }

    #[tokio::test]
    async fn leave_falls_back_to_the_agent_that_joined_the_document() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();
        session.handle_message(join("1", "a1")).await;
        session.handle_message(join("2", "b1")).await;

        let reply = session
            .handle_message(ClientMessage::LeaveDocument {
                client_id: "client".into(),
                doc_id: "1".into(),
                agent_id: None,
            })
            .await;

        assert_eq!(
            reply,
            Reply::frame(ServerMessage::LeaveDocumentSuccess {
                doc_id: "1".into(),
                client_id: "client".into(),
                agent_id: "a1".into(),
            })
        );
        assert!(harness.members("1").await.is_empty());
        assert_eq!(harness.members("2").await, BTreeSet::from(["b1".to_string()]));
        assert_eq!(harness.node.peer_owner(&PeerKey::new("1", "a1")), None);
        assert_eq!(harness.node.peer_owner(&PeerKey::new("2", "b1")), Some(session.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_uses_the_agent_recorded_per_document() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();
        session.handle_message(join("1", "a1")).await;
        session.handle_message(join("2", "b1")).await;

        tokio::time::advance(Duration::from_secs(50)).await;
        session.refresh_presence().await;
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(harness.members("1").await, BTreeSet::from(["a1".to_string()]));
        assert_eq!(harness.members("2").await, BTreeSet::from(["b1".to_string()]));
    }

    #[tokio::test]
    async fn reconnect_takes_over_the_peer_session() {
        let harness = Harness::new().await;
        let (mut stale, _r1) = harness.connect();
        let (mut fresh, _r2) = harness.connect();
        stale.handle_message(join("1", "a1")).await;
        fresh.handle_message(join("1", "a1")).await;

        let key = PeerKey::new("1", "a1");
        assert_eq!(harness.node.peer_owner(&key), Some(fresh.id()));

        stale.teardown().await;
        assert_eq!(harness.node.peer_owner(&key), Some(fresh.id()));
        assert_eq!(harness.journal.lock().unwrap().closed, 1);
        assert_eq!(harness.members("1").await, BTreeSet::from(["a1".to_string()]));
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_dropped() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();

        let unknown = session.handle_text(r#"{"type":"shout","payload":{}}"#).await;
        let garbage = session.handle_text("not json").await;
        let bad_payload = session.handle_text(r#"{"type":"join-document","payload":{}}"#).await;

        assert_eq!(unknown, Reply::default());
        assert_eq!(garbage, Reply::default());
        assert_eq!(bad_payload, Reply::default());
        let metrics = harness.node.metrics();
        assert_eq!(metrics.ws_frame_errors("unknown"), 1);
        assert_eq!(metrics.ws_frame_errors("malformed"), 1);
        assert_eq!(metrics.ws_frame_errors("join-document"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_long_lived_presence_alive() {
        let harness = Harness::new().await;
        let (mut session, _rx) = harness.connect();
        session.handle_message(join("1", "a1")).await;

        tokio::time::advance(Duration::from_secs(50)).await;
        session.refresh_presence().await;
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(harness.members("1").await, BTreeSet::from(["a1".to_string()]));
    }
}
