//! Scale adapter: room broadcasts across relay instances.
//!
//! A broadcast is delivered to local room members directly, then
//! published as a sync frame so every other instance delivers to its own
//! members. From the caller's point of view local and remote members are
//! indistinguishable. Publish failures degrade to local-only delivery,
//! logged and never fatal.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backbone::{Backbone, SYNC_CHANNEL};
use crate::connection::{ConnectionId, ConnectionTable, OutboundFrame};
use crate::protocol::{Namespace, SyncFrame, event_frame};
use crate::rooms::RoomRegistry;

pub struct ScaleAdapter {
    instance_id: String,
    registry: Arc<RoomRegistry>,
    connections: Arc<ConnectionTable>,
    backbone: Arc<dyn Backbone>,
}

impl ScaleAdapter {
    pub fn new(
        instance_id: String,
        registry: Arc<RoomRegistry>,
        connections: Arc<ConnectionTable>,
        backbone: Arc<dyn Backbone>,
    ) -> Self {
        Self {
            instance_id,
            registry,
            connections,
            backbone,
        }
    }

    /// Deliver an event to every connection in a room, on this instance
    /// and every other one. `exclude` suppresses the originating
    /// connection for client-triggered directed broadcasts.
    pub async fn broadcast(
        &self,
        namespace: Namespace,
        room: &str,
        event: &str,
        data: &Value,
        exclude: Option<ConnectionId>,
    ) {
        self.deliver_local(namespace, room, event, data, exclude);

        let frame = SyncFrame {
            origin: self.instance_id.clone(),
            namespace,
            event: event.to_string(),
            room: room.to_string(),
            data: data.clone(),
            exclude,
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize sync frame: {}", e);
                return;
            }
        };

        if let Err(e) = self.backbone.publish(SYNC_CHANNEL, payload).await {
            tracing::warn!(
                "Backbone publish failed, broadcast to '{}' delivered locally only: {}",
                room,
                e
            );
        }
    }

    /// Fan an event out to this instance's members of a room.
    pub fn deliver_local(
        &self,
        namespace: Namespace,
        room: &str,
        event: &str,
        data: &Value,
        exclude: Option<ConnectionId>,
    ) {
        let members = self.registry.members(namespace, room);
        if members.is_empty() {
            return;
        }

        let frame = event_frame(event, data);
        let mut delivered = 0usize;
        for conn in members {
            if Some(conn) == exclude {
                continue;
            }
            if let Some(handle) = self.connections.get(&conn) {
                if handle.send(OutboundFrame::Event(frame.clone())) {
                    delivered += 1;
                } else {
                    tracing::warn!("Dropping frame for closed connection '{}'", conn);
                }
            }
        }
        tracing::debug!(
            "Delivered '{}' to {} member(s) of {}/{}",
            event,
            delivered,
            namespace,
            room
        );
    }

    /// Apply sync frames published by other instances to local members.
    /// Runs until the relay shuts down; subscription recovery is the
    /// backbone's job.
    pub async fn run_sync_listener(&self, shutdown: CancellationToken) {
        let mut rx = match self.backbone.subscribe(vec![SYNC_CHANNEL.to_string()]).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!("Sync listener could not subscribe: {}", e);
                return;
            }
        };

        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                _ = shutdown.cancelled() => break,
            };
            let Some(message) = message else { break };

            let frame: SyncFrame = match serde_json::from_str(&message.payload) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Discarding malformed sync frame: {}", e);
                    continue;
                }
            };

            // Our own publish coming back around; local members already
            // have it.
            if frame.origin == self.instance_id {
                continue;
            }

            self.deliver_local(
                frame.namespace,
                &frame.room,
                &frame.event,
                &frame.data,
                frame.exclude,
            );
        }
        tracing::debug!("Sync listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::backbone::{BackboneError, MemoryBackbone, MockBackbone};
    use crate::connection::ConnectionHandle;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn identity(subject: &str) -> Identity {
        Identity {
            subject: subject.to_string(),
            email: None,
            role: None,
        }
    }

    struct Fixture {
        registry: Arc<RoomRegistry>,
        connections: Arc<ConnectionTable>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(RoomRegistry::new()),
                connections: Arc::new(ConnectionTable::new()),
            }
        }

        fn adapter(&self, instance_id: &str, backbone: Arc<dyn Backbone>) -> ScaleAdapter {
            ScaleAdapter::new(
                instance_id.to_string(),
                self.registry.clone(),
                self.connections.clone(),
                backbone,
            )
        }

        fn connect(
            &self,
            subject: &str,
            namespace: Namespace,
            rooms: &[&str],
        ) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let conn = Uuid::new_v4();
            self.connections.insert(
                conn,
                Arc::new(ConnectionHandle::new(identity(subject), namespace, tx, 0)),
            );
            for room in rooms {
                self.registry.join(namespace, room, conn);
            }
            (conn, rx)
        }
    }

    fn recv_event(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Option<Value> {
        match rx.try_recv() {
            Ok(OutboundFrame::Event(text)) => Some(serde_json::from_str(&text).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_room_members_only() {
        let fixture = Fixture::new();
        let adapter = fixture.adapter("i1", Arc::new(MemoryBackbone::new()));
        let (_, mut member) =
            fixture.connect("u1", Namespace::Contracts, &["contract:c1"]);
        let (_, mut outsider) = fixture.connect("u2", Namespace::Contracts, &["contract:c2"]);

        adapter
            .broadcast(
                Namespace::Contracts,
                "contract:c1",
                "contract:updated",
                &serde_json::json!({"status": "funded"}),
                None,
            )
            .await;

        let event = recv_event(&mut member).unwrap();
        assert_eq!(event["event"], "contract:updated");
        assert_eq!(event["data"]["status"], "funded");
        assert!(recv_event(&mut outsider).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originating_connection() {
        let fixture = Fixture::new();
        let adapter = fixture.adapter("i1", Arc::new(MemoryBackbone::new()));
        let (sender_conn, mut sender_rx) =
            fixture.connect("u1", Namespace::Messages, &["conversation:42"]);
        let (_, mut other_rx) = fixture.connect("u2", Namespace::Messages, &["conversation:42"]);

        adapter
            .broadcast(
                Namespace::Messages,
                "conversation:42",
                "typing:start",
                &serde_json::json!({"conversation_id": "42"}),
                Some(sender_conn),
            )
            .await;

        assert!(recv_event(&mut sender_rx).is_none());
        assert_eq!(recv_event(&mut other_rx).unwrap()["event"], "typing:start");
    }

    #[tokio::test]
    async fn test_broadcast_publishes_sync_frame() {
        let fixture = Fixture::new();
        let mut backbone = MockBackbone::new();
        backbone
            .expect_publish()
            .withf(|channel, payload| {
                let frame: SyncFrame = serde_json::from_str(payload).unwrap();
                channel == SYNC_CHANNEL
                    && frame.origin == "i1"
                    && frame.room == "contract:c1"
                    && frame.event == "contract:updated"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let adapter = fixture.adapter("i1", Arc::new(backbone));

        adapter
            .broadcast(
                Namespace::Contracts,
                "contract:c1",
                "contract:updated",
                &serde_json::json!({"status": "funded"}),
                None,
            )
            .await;
    }

    #[tokio::test]
    async fn test_publish_failure_still_delivers_locally() {
        let fixture = Fixture::new();
        let mut backbone = MockBackbone::new();
        backbone
            .expect_publish()
            .returning(|_, _| Err(BackboneError::Unavailable("down".to_string())));
        let adapter = fixture.adapter("i1", Arc::new(backbone));
        let (_, mut member) = fixture.connect("u1", Namespace::Messages, &["conversation:1"]);

        adapter
            .broadcast(
                Namespace::Messages,
                "conversation:1",
                "message:new",
                &serde_json::json!({"id": "m1"}),
                None,
            )
            .await;

        assert_eq!(recv_event(&mut member).unwrap()["event"], "message:new");
    }

    #[tokio::test]
    async fn test_sync_listener_applies_remote_frames_and_skips_own() {
        let fixture = Fixture::new();
        let backbone = Arc::new(MemoryBackbone::new());
        let adapter = Arc::new(fixture.adapter("i1", backbone.clone()));
        let (_, mut member) = fixture.connect("u1", Namespace::Contracts, &["contract:c1"]);

        let shutdown = CancellationToken::new();
        let listener = adapter.clone();
        let listener_shutdown = shutdown.clone();
        tokio::spawn(async move { listener.run_sync_listener(listener_shutdown).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // A frame from our own instance must not be double-delivered.
        let own = SyncFrame {
            origin: "i1".to_string(),
            namespace: Namespace::Contracts,
            event: "contract:updated".to_string(),
            room: "contract:c1".to_string(),
            data: serde_json::json!({"status": "own"}),
            exclude: None,
        };
        backbone
            .publish(SYNC_CHANNEL, serde_json::to_string(&own).unwrap())
            .await
            .unwrap();

        let remote = SyncFrame {
            origin: "i2".to_string(),
            ..own.clone()
        };
        let remote = SyncFrame {
            data: serde_json::json!({"status": "remote"}),
            ..remote
        };
        backbone
            .publish(SYNC_CHANNEL, serde_json::to_string(&remote).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let event = recv_event(&mut member).unwrap();
        assert_eq!(event["data"]["status"], "remote");
        assert!(recv_event(&mut member).is_none());
        shutdown.cancel();
    }
}
