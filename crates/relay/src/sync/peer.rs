// Boundary between the relay and the CRDT engine.
//
// A peer session proxies one agent's view of one document. The relay never
// looks inside the messages that cross this boundary.

use std::{fmt, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identity of a peer session: one per (document, agent) on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey {
    pub doc_id: String,
    pub agent_id: String,
}

impl PeerKey {
    pub fn new(doc_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self { doc_id: doc_id.into(), agent_id: agent_id.into() }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.doc_id, self.agent_id)
    }
}

/// Message a peer session wants delivered to its client.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub key: PeerKey,
    pub message: Value,
    /// Set when the message carries document changes the client lacks.
    pub changes: Option<bool>,
}

pub type LocalUpdateSender = mpsc::UnboundedSender<LocalUpdate>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer session {0} is closed")]
    Closed(PeerKey),

    #[error("peer session {0} has not been opened")]
    NotOpen(PeerKey),

    #[error("document `{0}` is not loaded")]
    UnknownDocument(String),

    #[error("sync message for document `{found}` sent to session bound to `{expected}`")]
    DocumentMismatch { expected: String, found: String },

    #[error("malformed sync message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("undecodable CRDT payload: {0}")]
    Decode(String),

    #[error("failed to apply CRDT update: {0}")]
    Apply(String),
}

/// One agent's CRDT session on one document.
///
/// `receive_remote_update` is synchronous and may emit local updates on the
/// session's channel before it returns. Using a session after `close` fails
/// with [`PeerError::Closed`].
pub trait PeerAdapter: Send {
    fn key(&self) -> &PeerKey;

    fn open(&mut self) -> Result<(), PeerError>;

    fn receive_remote_update(&mut self, message: &Value) -> Result<(), PeerError>;

    fn close(&mut self) -> Result<(), PeerError>;

    fn is_open(&self) -> bool;
}

/// Shared structure peer sessions attach to.
pub trait PeerRegistry: Send + Sync {
    /// Creates an unopened session that emits on `updates`.
    fn attach(self: Arc<Self>, key: PeerKey, updates: LocalUpdateSender) -> Box<dyn PeerAdapter>;
}
