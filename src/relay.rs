//! The relay server: one constructed object owning the room registry,
//! scale adapter, and inbound bridge.
//!
//! Nothing here is a global: multi-instance behavior is tested by
//! building two `RelayServer`s over one shared backbone. The WebSocket
//! layer (`gateway`) is a thin adapter over [`RelayServer::attach`],
//! [`RelayServer::handle_client_message`], and [`RelayServer::detach`],
//! which keeps the concurrency contract testable without sockets.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{Authenticator, Identity};
use crate::backbone::Backbone;
use crate::bridge::InboundBridge;
use crate::config::Config;
use crate::connection::{ConnectionHandle, ConnectionId, ConnectionTable, OutboundFrame, epoch_ms};
use crate::fanout::ScaleAdapter;
use crate::protocol::{ClientMessage, Namespace, event_frame};
use crate::rooms::RoomRegistry;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Rooms a recently-disconnected subject may resume within the grace
/// window. Events published while disconnected are dropped, not replayed.
struct GraceEntry {
    rooms: Vec<String>,
    expires_at_ms: i64,
}

pub struct RelayServer {
    config: Config,
    instance_id: String,
    authenticator: Authenticator,
    registry: Arc<RoomRegistry>,
    connections: Arc<ConnectionTable>,
    fanout: Arc<ScaleAdapter>,
    backbone: Arc<dyn Backbone>,
    grace: DashMap<(Namespace, String), GraceEntry>,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(config: Config, backbone: Arc<dyn Backbone>) -> Arc<Self> {
        let instance_id = Uuid::new_v4().to_string();
        let registry = Arc::new(RoomRegistry::new());
        let connections = Arc::new(ConnectionTable::new());
        let fanout = Arc::new(ScaleAdapter::new(
            instance_id.clone(),
            registry.clone(),
            connections.clone(),
            backbone.clone(),
        ));
        let authenticator = Authenticator::new(&config.jwt_secret);

        Arc::new(Self {
            config,
            instance_id,
            authenticator,
            registry,
            connections,
            fanout,
            backbone,
            grace: DashMap::new(),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register an authenticated connection. Auto-joins the personal
    /// room, resumes grace-window rooms if any, and queues the
    /// `connected` acknowledgment. Returns the connection id and the
    /// receiving half of its outbound channel.
    pub fn attach(
        &self,
        namespace: Namespace,
        identity: Identity,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>) {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let now = epoch_ms();
        let handle = Arc::new(ConnectionHandle::new(identity.clone(), namespace, tx, now));
        self.connections.insert(conn, handle.clone());

        self.registry.join(namespace, &identity.personal_room(), conn);

        for room in self.take_grace(namespace, &identity.subject, now) {
            tracing::info!(
                "Connection '{}' resumed room '{}' within grace window",
                conn,
                room
            );
            self.registry.join(namespace, &room, conn);
        }

        handle.send(OutboundFrame::Event(event_frame(
            "connected",
            &serde_json::json!({ "sid": conn, "subject": identity.subject }),
        )));

        tracing::info!(
            "Connection '{}' authenticated as '{}' on namespace '{}'",
            conn,
            identity.subject,
            namespace
        );
        (conn, rx)
    }

    /// Drop a connection and release its memberships. Non-personal rooms
    /// are remembered per (namespace, subject) for the grace window.
    /// Safe to call more than once for the same id.
    pub fn detach(&self, conn: ConnectionId) {
        let Some(handle) = self.connections.remove(&conn) else {
            return;
        };

        let released = self.registry.leave_all(conn);
        let personal = handle.identity.personal_room();
        let resumable: Vec<String> = released
            .into_iter()
            .map(|(_, room)| room)
            .filter(|room| *room != personal)
            .collect();

        if !resumable.is_empty() {
            self.grace.insert(
                (handle.namespace, handle.identity.subject.clone()),
                GraceEntry {
                    rooms: resumable,
                    expires_at_ms: epoch_ms() + self.config.grace_window.as_millis() as i64,
                },
            );
        }

        tracing::info!(
            "Connection '{}' ('{}') disconnected from namespace '{}'",
            conn,
            handle.identity.subject,
            handle.namespace
        );
    }

    /// Record inbound activity for the heartbeat timeout.
    pub fn touch(&self, conn: ConnectionId) {
        if let Some(handle) = self.connections.get(&conn) {
            handle.touch(epoch_ms());
        }
    }

    /// Handle one control message from a connected client. Messages
    /// outside the namespace's vocabulary, like unparseable ones, are
    /// logged and ignored; they never crash or disconnect anything.
    pub async fn handle_client_message(&self, conn: ConnectionId, text: &str) {
        let Some(handle) = self.connections.get(&conn) else {
            return;
        };

        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring unparseable message from '{}': {}", conn, e);
                return;
            }
        };

        let namespace = handle.namespace;
        match (namespace, message) {
            (Namespace::Messages, ClientMessage::JoinConversation { id }) => {
                self.registry.join(namespace, &format!("conversation:{id}"), conn);
            }
            (Namespace::Messages, ClientMessage::LeaveConversation { id }) => {
                self.registry.leave(namespace, &format!("conversation:{id}"), conn);
            }
            (Namespace::Contracts, ClientMessage::JoinContract { id }) => {
                self.registry.join(namespace, &format!("contract:{id}"), conn);
            }
            (Namespace::Contracts, ClientMessage::LeaveContract { id }) => {
                self.registry.leave(namespace, &format!("contract:{id}"), conn);
            }
            (Namespace::Messages, ClientMessage::TypingStart { conversation_id }) => {
                self.relay_typing(conn, &handle.identity, "typing:start", &conversation_id)
                    .await;
            }
            (Namespace::Messages, ClientMessage::TypingStop { conversation_id }) => {
                self.relay_typing(conn, &handle.identity, "typing:stop", &conversation_id)
                    .await;
            }
            (Namespace::Notifications, ClientMessage::NotificationRead { id }) => {
                // Read-state lives in the backend; this is diagnostic only.
                tracing::info!(
                    "'{}' acknowledged notification '{}'",
                    handle.identity.subject,
                    id
                );
            }
            (_, ClientMessage::Pong) => {
                // Liveness already recorded by the socket loop.
            }
            (namespace, message) => {
                tracing::warn!(
                    "Ignoring message outside '{}' vocabulary from '{}': {:?}",
                    namespace,
                    conn,
                    message
                );
            }
        }
    }

    /// Ephemeral typing signal: everyone else in the conversation room,
    /// on any instance, except the sender.
    async fn relay_typing(&self, conn: ConnectionId, identity: &Identity, event: &str, conversation_id: &str) {
        let room = format!("conversation:{conversation_id}");
        let data = serde_json::json!({
            "conversation_id": conversation_id,
            "from": identity.subject,
        });
        self.fanout
            .broadcast(Namespace::Messages, &room, event, &data, Some(conn))
            .await;
    }

    /// Drop connections that have missed heartbeats past the timeout.
    /// Returns how many were dropped.
    pub fn sweep_stale(&self) -> usize {
        let now = epoch_ms();
        let stale = self
            .connections
            .stale(self.config.heartbeat_timeout.as_millis() as i64, now);
        let dropped = stale.len();
        for conn in stale {
            tracing::warn!("Connection '{}' missed heartbeats, dropping", conn);
            self.detach(conn);
        }

        self.grace.retain(|_, entry| entry.expires_at_ms > now);
        dropped
    }

    fn take_grace(&self, namespace: Namespace, subject: &str, now_ms: i64) -> Vec<String> {
        match self.grace.remove(&(namespace, subject.to_string())) {
            Some((_, entry)) if entry.expires_at_ms > now_ms => entry.rooms,
            _ => Vec::new(),
        }
    }

    /// Spawn the inbound bridge, the sync listener, and the lifecycle
    /// sweep. All three stop when the shutdown token fires.
    pub fn spawn_background(self: &Arc<Self>) {
        let bridge = InboundBridge::new(self.backbone.clone(), self.fanout.clone());
        let bridge_shutdown = self.shutdown.clone();
        tokio::spawn(async move { bridge.run(bridge_shutdown).await });

        let fanout = self.fanout.clone();
        let sync_shutdown = self.shutdown.clone();
        tokio::spawn(async move { fanout.run_sync_listener(sync_shutdown).await });

        let server = self.clone();
        let sweep_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.connections.ping_all();
                        server.sweep_stale();
                    }
                    _ = sweep_shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Bind the listener and serve until a shutdown signal. Stops
    /// accepting first, then cancels the backbone tasks.
    pub async fn run(self: Arc<Self>) -> Result<(), RelayError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;

        self.spawn_background();

        tracing::info!(
            "Relay instance '{}' listening on {} ({})",
            self.instance_id,
            listener.local_addr()?,
            self.config.environment
        );
        tracing::info!("Namespaces: ws://{}/ws/{{notifications,messages,contracts}}", addr);

        let shutdown = self.shutdown.clone();
        let app = crate::gateway::router(self.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(crate::gateway::shutdown_signal(shutdown.clone()))
            .await?;

        // Listener is closed; now stop the backbone tasks.
        shutdown.cancel();
        tracing::info!("Relay shutdown complete");
        Ok(())
    }
}
