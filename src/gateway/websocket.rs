//! WebSocket connection handling.
//!
//! The handshake authenticates before anything else: an unknown
//! namespace path is a plain 404, and a bad credential still gets an
//! upgraded socket just long enough to receive an `error` event with the
//! rejection reason before the transport closes, so clients can tell
//! "bad credential" from "network failure".

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;

use crate::auth::Identity;
use crate::connection::OutboundFrame;
use crate::protocol::{Namespace, event_frame};
use crate::relay::RelayServer;

/// Query parameters accepted at connect time.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Credential, conventionally `Bearer <jwt>`. The Authorization
    /// header works too; the query form exists because browser WebSocket
    /// clients cannot set headers.
    pub token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(namespace): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    State(server): State<Arc<RelayServer>>,
) -> Result<impl IntoResponse, StatusCode> {
    let Ok(namespace) = namespace.parse::<Namespace>() else {
        return Err(StatusCode::NOT_FOUND);
    };

    let credential = query.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    match server.authenticator().verify(credential.as_deref()) {
        Ok(identity) => {
            Ok(ws.on_upgrade(move |socket| handle_socket(socket, server, namespace, identity)))
        }
        Err(e) => {
            tracing::warn!("Rejected connection on namespace '{}': {}", namespace, e);
            let reason = e.client_reason();
            Ok(ws.on_upgrade(move |socket| reject_socket(socket, reason)))
        }
    }
}

/// Tell a rejected client why, then close. The connection is never
/// registered; no room membership exists at any point.
async fn reject_socket(mut socket: WebSocket, reason: &'static str) {
    let frame = event_frame("error", &serde_json::json!({ "message": reason }));
    let _ = socket.send(Message::Text(frame.into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(
    socket: WebSocket,
    server: Arc<RelayServer>,
    namespace: Namespace,
    identity: Identity,
) {
    let (conn, mut outbound) = server.attach(namespace, identity);
    let (mut sender, mut receiver) = socket.split();

    // Write loop: drains the outbound channel. Ends when the channel
    // closes (detach dropped the handle) or the socket goes away.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                OutboundFrame::Event(text) => Message::Text(text.into()),
                OutboundFrame::Ping => Message::Ping(Bytes::new()),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // Read loop: every inbound frame counts as liveness; text frames are
    // control messages.
    let recv_server = server.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("WebSocket error on connection '{}': {}", conn, e);
                    break;
                }
            };

            recv_server.touch(conn);
            match message {
                Message::Text(text) => {
                    recv_server.handle_client_message(conn, text.as_str()).await;
                }
                Message::Close(_) => break,
                // Pings and pongs feed liveness only.
                _ => {}
            }
        }
    });

    // Whichever loop finishes first cancels the other; closing one
    // connection never blocks another.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    server.detach(conn);
}
