// WebSocket connection manager: `/ws` upgrade, per-connection loop, and the
// node-wide registry of connections and peer sessions.

mod handler;
pub mod node;
pub mod session;

use std::sync::Arc;

use axum::{routing::get, Router};

pub use node::{ConnectionId, RelayNode};
pub use session::{ConnectionSession, ConnectionState, Reply, Termination};

pub fn router(node: Arc<RelayNode>) -> Router {
    Router::new().route("/ws", get(handler::ws_upgrade)).with_state(node)
}
