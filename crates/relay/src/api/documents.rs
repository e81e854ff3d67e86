// Read-only document endpoint.
//
// Routes:
//   GET /api/v0/doc/{doc_id}  serialized CRDT state of a loaded document

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::{ErrorCode, RelayError},
    sync::repository::validate_doc_id,
    ws::RelayNode,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SerializedDocumentResponse {
    /// Base64 of the document's full yrs v1 update.
    pub serialized_document: String,
}

pub fn router(node: Arc<RelayNode>) -> Router {
    Router::new().route("/api/v0/doc/{doc_id}", get(get_document)).with_state(node)
}

/// Only documents this node has loaded are served; unknown ids are 404 and
/// never created. Ids no document could carry are rejected up front.
async fn get_document(
    State(node): State<Arc<RelayNode>>,
    Path(doc_id): Path<String>,
) -> Result<Json<SerializedDocumentResponse>, RelayError> {
    validate_doc_id(&doc_id).map_err(|error| {
        RelayError::from(error).with_details(json!({ "field": "docId" }))
    })?;
    let repository = node.repository();
    let document = repository.get_doc(&doc_id).ok_or_else(|| {
        RelayError::new(ErrorCode::NotFound, "document not found")
            .with_details(json!({ "doc_id": doc_id }))
    })?;

    Ok(Json(SerializedDocumentResponse {
        serialized_document: repository.serialize_doc(&document),
    }))
}
