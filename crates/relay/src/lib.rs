pub mod api;
pub mod config;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod presence;
pub mod sync;
pub mod ws;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tracing::{error, info};

use crate::{
    config::RelayConfig,
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    metrics::RelayMetrics,
    presence::PresenceBackend,
    sync::repository::DocumentRepository,
    ws::RelayNode,
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Connects the configured presence backend and builds a node on it.
pub async fn start_node(config: RelayConfig) -> anyhow::Result<Arc<RelayNode>> {
    let presence = PresenceBackend::connect(config.redis_url.as_deref())
        .await
        .context("failed to connect presence backend")?;
    start_node_with_presence(config, presence).await
}

/// Builds a node on an existing backend. Nodes built on clones of one
/// backend behave like separate processes sharing one Redis.
pub async fn start_node_with_presence(
    config: RelayConfig,
    presence: PresenceBackend,
) -> anyhow::Result<Arc<RelayNode>> {
    let repository = DocumentRepository::start(presence, &config)
        .await
        .context("failed to subscribe to presence bus")?;
    Ok(RelayNode::new(config, repository, Arc::new(RelayMetrics::default())))
}

pub fn build_router(node: Arc<RelayNode>) -> Router {
    let cors = cors::cors_layer(node.config().cors_origins.as_deref());
    apply_middleware(
        Router::new().merge(ws::router(Arc::clone(&node))).merge(api::router(Arc::clone(&node))),
        Arc::clone(node.metrics()),
    )
    .layer(cors)
}

fn apply_middleware(router: Router, metrics: Arc<RelayMetrics>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(
    State(metrics): State<Arc<RelayMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    metrics.record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
