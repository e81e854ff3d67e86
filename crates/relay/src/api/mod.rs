pub mod documents;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::ws::RelayNode;

/// Plain HTTP surface: health, metrics and the document read path.
pub fn router(node: Arc<RelayNode>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(Arc::clone(&node))
        .merge(documents::router(node))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(node): State<Arc<RelayNode>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        node.metrics().render_prometheus(),
    )
}
