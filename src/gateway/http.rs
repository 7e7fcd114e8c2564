//! Plain HTTP endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;

use crate::relay::RelayServer;

/// Liveness probe, independent of the WebSocket transport.
pub async fn healthz(State(server): State<Arc<RelayServer>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime": server.uptime_secs(),
    }))
}
