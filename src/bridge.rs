//! Inbound bridge: the backend's only way into the relay.
//!
//! Subscribes to the single well-known backbone channel the backend
//! publishes fan-out envelopes to. Every message is parsed and validated
//! at this boundary; anything malformed is logged and dropped without
//! disturbing the subscription. The backend has no other handle here:
//! no direct socket access, no RPC.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backbone::{Backbone, EVENT_CHANNEL};
use crate::fanout::ScaleAdapter;
use crate::protocol::Envelope;

pub struct InboundBridge {
    backbone: Arc<dyn Backbone>,
    fanout: Arc<ScaleAdapter>,
}

impl InboundBridge {
    pub fn new(backbone: Arc<dyn Backbone>, fanout: Arc<ScaleAdapter>) -> Self {
        Self { backbone, fanout }
    }

    /// Consume backend envelopes until shutdown. Bad input never stops
    /// the loop; only shutdown or a closed subscription does.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut rx = match self.backbone.subscribe(vec![EVENT_CHANNEL.to_string()]).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!("Inbound bridge could not subscribe: {}", e);
                return;
            }
        };
        tracing::info!("Inbound bridge listening on '{}'", EVENT_CHANNEL);

        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                _ = shutdown.cancelled() => break,
            };
            let Some(message) = message else { break };

            let envelope = match Envelope::parse(&message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Discarding backbone envelope: {}", e);
                    continue;
                }
            };

            // Every instance's bridge receives this same envelope from
            // the backbone, so each delivers to its own connections only;
            // re-publishing on the sync channel would double-deliver.
            self.fanout.deliver_local(
                envelope.namespace,
                &envelope.room,
                &envelope.event,
                &serde_json::Value::Object(envelope.data),
                None,
            );
        }
        tracing::debug!("Inbound bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::backbone::MemoryBackbone;
    use crate::connection::{ConnectionHandle, ConnectionTable, OutboundFrame};
    use crate::protocol::Namespace;
    use crate::rooms::RoomRegistry;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn start_bridge(
        backbone: Arc<MemoryBackbone>,
    ) -> (
        Arc<RoomRegistry>,
        Arc<ConnectionTable>,
        CancellationToken,
    ) {
        let registry = Arc::new(RoomRegistry::new());
        let connections = Arc::new(ConnectionTable::new());
        let fanout = Arc::new(ScaleAdapter::new(
            "i1".to_string(),
            registry.clone(),
            connections.clone(),
            backbone.clone(),
        ));
        let bridge = InboundBridge::new(backbone, fanout);
        let shutdown = CancellationToken::new();
        let bridge_shutdown = shutdown.clone();
        tokio::spawn(async move { bridge.run(bridge_shutdown).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        (registry, connections, shutdown)
    }

    fn join_connection(
        registry: &RoomRegistry,
        connections: &ConnectionTable,
        subject: &str,
        namespace: Namespace,
        room: &str,
    ) -> mpsc::UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        let identity = Identity {
            subject: subject.to_string(),
            email: None,
            role: None,
        };
        connections.insert(conn, Arc::new(ConnectionHandle::new(identity, namespace, tx, 0)));
        registry.join(namespace, room, conn);
        rx
    }

    #[tokio::test]
    async fn test_valid_envelope_reaches_room_members() {
        let backbone = Arc::new(MemoryBackbone::new());
        let (registry, connections, shutdown) = start_bridge(backbone.clone()).await;
        let mut rx = join_connection(
            &registry,
            &connections,
            "u1",
            Namespace::Notifications,
            "user:u1",
        );

        backbone
            .publish(
                EVENT_CHANNEL,
                r#"{"namespace":"notifications","event":"notification:new","room":"user:u1","data":{"id":"n1"}}"#.to_string(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let OutboundFrame::Event(text) = rx.try_recv().unwrap() else {
            panic!("expected event frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "notification:new");
        assert_eq!(value["data"]["id"], "n1");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bad_input_is_dropped_and_bridge_keeps_serving() {
        let backbone = Arc::new(MemoryBackbone::new());
        let (registry, connections, shutdown) = start_bridge(backbone.clone()).await;
        let mut rx = join_connection(
            &registry,
            &connections,
            "u1",
            Namespace::Contracts,
            "contract:c1",
        );

        // Malformed JSON, a missing room, and an unknown namespace: all
        // discarded with zero socket emissions.
        for bad in [
            "{oops",
            r#"{"namespace":"contracts","event":"contract:updated","data":{"x":1}}"#,
            r#"{"namespace":"billing","event":"invoice:paid","room":"contract:c1","data":{"x":1}}"#,
        ] {
            backbone
                .publish(EVENT_CHANNEL, bad.to_string())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        // The next valid envelope still goes through.
        backbone
            .publish(
                EVENT_CHANNEL,
                r#"{"namespace":"contracts","event":"contract:updated","room":"contract:c1","data":{"status":"active"}}"#.to_string(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Event(_))));
        shutdown.cancel();
    }
}
