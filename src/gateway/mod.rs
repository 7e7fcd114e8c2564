//! HTTP/WebSocket surface of the relay.

mod http;
mod signal;
mod websocket;

use std::sync::Arc;

use axum::{Router, routing::get};
use axum::http::{HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::relay::RelayServer;

pub use signal::shutdown_signal;

/// Build the relay's router: one WebSocket endpoint per namespace path
/// plus the liveness probe.
pub fn router(server: Arc<RelayServer>) -> Router {
    let cors = cors_layer(&server.config().allowed_origins);

    Router::new()
        .route("/ws/{namespace}", get(websocket::websocket_handler))
        .route("/healthz", get(http::healthz))
        .with_state(server)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring unparseable allowed origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(origins)
}
