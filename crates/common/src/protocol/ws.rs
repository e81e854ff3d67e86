// WebSocket frame types for the document relay protocol.
//
// Every frame is a JSON text message shaped `{ "type": ..., "payload": {...} }`.
// Payload field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::presence::PresenceDelta;

/// Frame types a client may send, in declaration order of [`ClientMessage`].
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "join-document",
    "leave-document",
    "automerge-connection-send",
    "remote-agent-setselection",
];

/// Frame types the relay may send, in declaration order of [`ServerMessage`].
pub const SERVER_MESSAGE_TYPES: &[&str] = &[
    "keepalive",
    "join-document-success",
    "leave-document-success",
    "server-update",
    "remote-agent-setselection-from-server",
    "update-active-user-list",
];

/// Client -> Server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Subscribe to a document and announce presence on it.
    JoinDocument { client_id: String, doc_id: String },

    /// Unsubscribe from a document.
    LeaveDocument {
        client_id: String,
        doc_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },

    /// Opaque CRDT sync message destined for the agent's peer session.
    AutomergeConnectionSend { client_id: String, doc_id: String, message: Value },

    /// Ephemeral cursor / selection broadcast.
    RemoteAgentSetselection { client_id: String, doc_id: String, message: Selection },
}

impl ClientMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::JoinDocument { .. } => "join-document",
            Self::LeaveDocument { .. } => "leave-document",
            Self::AutomergeConnectionSend { .. } => "automerge-connection-send",
            Self::RemoteAgentSetselection { .. } => "remote-agent-setselection",
        }
    }
}

/// Server -> Client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Keepalive {},

    JoinDocumentSuccess { doc_id: String, client_id: String, agent_id: String },

    LeaveDocumentSuccess { doc_id: String, client_id: String, agent_id: String },

    /// Opaque CRDT sync message produced by the agent's peer session.
    /// `changes` is present when the message carries a non-empty diff.
    ServerUpdate {
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changes: Option<bool>,
    },

    RemoteAgentSetselectionFromServer { client_id: String, doc_id: String, message: Selection },

    UpdateActiveUserList {
        doc_id: String,
        added_ids: Vec<String>,
        removed_ids: Vec<String>,
        active_ids: Vec<String>,
    },
}

impl ServerMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Keepalive {} => "keepalive",
            Self::JoinDocumentSuccess { .. } => "join-document-success",
            Self::LeaveDocumentSuccess { .. } => "leave-document-success",
            Self::ServerUpdate { .. } => "server-update",
            Self::RemoteAgentSetselectionFromServer { .. } => {
                "remote-agent-setselection-from-server"
            }
            Self::UpdateActiveUserList { .. } => "update-active-user-list",
        }
    }
}

impl From<PresenceDelta> for ServerMessage {
    fn from(delta: PresenceDelta) -> Self {
        Self::UpdateActiveUserList {
            doc_id: delta.doc_id,
            added_ids: delta.added_ids,
            removed_ids: delta.removed_ids,
            active_ids: delta.active_ids,
        }
    }
}

/// A remote agent's selection. Anchor and focus are editor points and are
/// relayed untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub anchor: Value,
    pub focus: Value,
    pub mark: SelectionMark,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionMark {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(ClientMessage),
    /// Well-formed envelope with a `type` this protocol does not define.
    Unknown { message_type: String },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("invalid payload for `{message_type}` frame: {source}")]
    InvalidPayload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn decode_client_frame(raw: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(raw).map_err(FrameError::Malformed)?;
    let message_type =
        value.get("type").and_then(Value::as_str).ok_or(FrameError::MissingType)?.to_owned();

    if !CLIENT_MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Ok(InboundFrame::Unknown { message_type });
    }

    serde_json::from_value::<ClientMessage>(value)
        .map(InboundFrame::Message)
        .map_err(|source| FrameError::InvalidPayload { message_type, source })
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
