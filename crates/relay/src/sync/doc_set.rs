// In-memory document registry backed by yrs, and the peer sessions that sync
// clients against it.
//
// Sync messages are JSON objects `{ docId, stateVector?, update? }` whose
// binary fields are base64-encoded yrs v1 encodings.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use super::peer::{LocalUpdate, LocalUpdateSender, PeerAdapter, PeerError, PeerKey, PeerRegistry};

/// Name of the shared text every document carries.
pub const CONTENT_TEXT: &str = "content";

const SAMPLE_TEXT: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. \
Sed do eiusmod tempor incididunt ut labore et dolore magna aliqua.\n\n\
Ut enim ad minim veniam, quis nostrud exercitation ullamco laboris nisi ut aliquip \
ex ea commodo consequat.";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_vector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
}

impl SyncMessage {
    fn into_value(self) -> Value {
        // A struct of strings always serializes.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A live collaborative document.
///
/// yrs allows one write transaction per document at a time, so every access
/// goes through the document's lock.
pub struct Document {
    id: String,
    doc: Mutex<Doc>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), doc: Mutex::new(Doc::new()) }
    }

    pub fn with_sample_text(id: impl Into<String>) -> Self {
        let document = Self::new(id);
        document.insert_text(0, SAMPLE_TEXT);
        document
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn doc(&self) -> MutexGuard<'_, Doc> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full document state as a yrs v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc().transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc().transact().state_vector()
    }

    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        self.doc().transact().encode_diff_v1(remote)
    }

    pub fn apply_update(&self, data: &[u8]) -> Result<(), PeerError> {
        let update = Update::decode_v1(data).map_err(|e| PeerError::Decode(e.to_string()))?;
        let doc = self.doc();
        let mut txn = doc.transact_mut();
        txn.apply_update(update).map_err(|e| PeerError::Apply(e.to_string()))
    }

    pub fn text(&self) -> String {
        let doc = self.doc();
        let text = doc.get_or_insert_text(CONTENT_TEXT);
        let txn = doc.transact();
        text.get_string(&txn)
    }

    pub fn insert_text(&self, index: u32, content: &str) {
        let doc = self.doc();
        let text = doc.get_or_insert_text(CONTENT_TEXT);
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, index, content);
    }
}

struct PeerBinding {
    key: PeerKey,
    updates: LocalUpdateSender,
}

/// Registry of loaded documents and the peer sessions attached to them.
#[derive(Default)]
pub struct DocSet {
    docs: RwLock<HashMap<String, Arc<Document>>>,
    peers: Mutex<HashMap<u64, PeerBinding>>,
    next_peer_id: AtomicU64,
}

impl DocSet {
    pub fn get(&self, doc_id: &str) -> Option<Arc<Document>> {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).get(doc_id).cloned()
    }

    pub fn get_or_create(&self, doc_id: &str) -> Arc<Document> {
        if let Some(existing) = self.get(doc_id) {
            return existing;
        }
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(docs.entry(doc_id.to_owned()).or_insert_with(|| {
            debug!(doc_id = %doc_id, "created document");
            Arc::new(Document::new(doc_id))
        }))
    }

    pub fn insert(&self, document: Document) {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(document.id().to_owned(), Arc::new(document));
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn open_peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn register_peer(&self, key: &PeerKey, updates: &LocalUpdateSender) -> u64 {
        let id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.insert(id, PeerBinding { key: key.clone(), updates: updates.clone() });
        id
    }

    fn unregister_peer(&self, id: u64) {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }

    /// Sends `update` to every open session on `doc_id` except `origin`.
    fn fan_out(&self, origin: u64, doc_id: &str, update: &str) {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, binding) in peers.iter() {
            if *id == origin || binding.key.doc_id != doc_id {
                continue;
            }
            let message = SyncMessage {
                doc_id: doc_id.to_owned(),
                update: Some(update.to_owned()),
                ..SyncMessage::default()
            };
            // A closed receiver means the connection is tearing down.
            let _ = binding.updates.send(LocalUpdate {
                key: binding.key.clone(),
                message: message.into_value(),
                changes: Some(true),
            });
        }
    }
}

impl PeerRegistry for DocSet {
    fn attach(self: Arc<Self>, key: PeerKey, updates: LocalUpdateSender) -> Box<dyn PeerAdapter> {
        Box::new(DocPeer { key, set: self, updates, state: PeerState::Idle })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Idle,
    Open(u64),
    Closed,
}

struct DocPeer {
    key: PeerKey,
    set: Arc<DocSet>,
    updates: LocalUpdateSender,
    state: PeerState,
}

impl DocPeer {
    fn emit(&self, message: SyncMessage, changes: Option<bool>) {
        let _ = self.updates.send(LocalUpdate {
            key: self.key.clone(),
            message: message.into_value(),
            changes,
        });
    }

    fn document(&self) -> Result<Arc<Document>, PeerError> {
        self.set
            .get(&self.key.doc_id)
            .ok_or_else(|| PeerError::UnknownDocument(self.key.doc_id.clone()))
    }
}

impl PeerAdapter for DocPeer {
    fn key(&self) -> &PeerKey {
        &self.key
    }

    fn open(&mut self) -> Result<(), PeerError> {
        match self.state {
            PeerState::Open(_) => return Ok(()),
            PeerState::Closed => return Err(PeerError::Closed(self.key.clone())),
            PeerState::Idle => {}
        }

        let document = self.document()?;
        let id = self.set.register_peer(&self.key, &self.updates);
        self.state = PeerState::Open(id);
        trace!(peer = %self.key, "peer session opened");

        // Ask the client for whatever it has that we lack.
        self.emit(
            SyncMessage {
                doc_id: self.key.doc_id.clone(),
                state_vector: Some(STANDARD.encode(document.state_vector().encode_v1())),
                ..SyncMessage::default()
            },
            None,
        );
        Ok(())
    }

    fn receive_remote_update(&mut self, message: &Value) -> Result<(), PeerError> {
        let id = match self.state {
            PeerState::Open(id) => id,
            PeerState::Idle => return Err(PeerError::NotOpen(self.key.clone())),
            PeerState::Closed => return Err(PeerError::Closed(self.key.clone())),
        };

        let message = SyncMessage::deserialize(message)?;
        if message.doc_id != self.key.doc_id {
            return Err(PeerError::DocumentMismatch {
                expected: self.key.doc_id.clone(),
                found: message.doc_id,
            });
        }
        let document = self.document()?;

        if let Some(update) = &message.update {
            let bytes = STANDARD.decode(update).map_err(|e| PeerError::Decode(e.to_string()))?;
            document.apply_update(&bytes)?;
            self.set.fan_out(id, &self.key.doc_id, update);
        }

        if let Some(state_vector) = &message.state_vector {
            let bytes =
                STANDARD.decode(state_vector).map_err(|e| PeerError::Decode(e.to_string()))?;
            let remote =
                StateVector::decode_v1(&bytes).map_err(|e| PeerError::Decode(e.to_string()))?;
            let changes = document.state_vector() != remote;
            self.emit(
                SyncMessage {
                    doc_id: self.key.doc_id.clone(),
                    update: Some(STANDARD.encode(document.encode_diff(&remote))),
                    ..SyncMessage::default()
                },
                Some(changes),
            );
        }

        Ok(())
    }

    fn close(&mut self) -> Result<(), PeerError> {
        match self.state {
            PeerState::Closed => Err(PeerError::Closed(self.key.clone())),
            PeerState::Idle => {
                self.state = PeerState::Closed;
                Ok(())
            }
            PeerState::Open(id) => {
                self.set.unregister_peer(id);
                self.state = PeerState::Closed;
                trace!(peer = %self.key, "peer session closed");
                Ok(())
            }
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, PeerState::Open(_))
    }
}

impl Drop for DocPeer {
    fn drop(&mut self) {
        if let PeerState::Open(id) = self.state {
            self.set.unregister_peer(id);
        }
    }
}
