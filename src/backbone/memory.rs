//! In-process backbone backed by a broadcast channel.
//!
//! Used by tests and single-node development runs. Cloning the backbone
//! and handing it to several relay instances makes them behave exactly
//! like instances sharing one Redis deployment, without the server.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{Backbone, BackboneError, BackboneMessage};

#[derive(Clone)]
pub struct MemoryBackbone {
    bus: broadcast::Sender<BackboneMessage>,
}

impl MemoryBackbone {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(256);
        Self { bus }
    }
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BackboneError> {
        // No subscribers yet is fine; pub/sub has no delivery guarantee.
        let _ = self.bus.send(BackboneMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> Result<mpsc::UnboundedReceiver<BackboneMessage>, BackboneError> {
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(message) => {
                        if !channels.contains(&message.channel) {
                            continue;
                        }
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    // A slow subscriber just misses messages, mirroring
                    // real pub/sub semantics.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_only_its_channels() {
        let backbone = MemoryBackbone::new();
        let mut rx = backbone
            .subscribe(vec!["relay.events".to_string()])
            .await
            .unwrap();

        backbone
            .publish("relay.sync", "ignored".to_string())
            .await
            .unwrap();
        backbone
            .publish("relay.events", "wanted".to_string())
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, "relay.events");
        assert_eq!(message.payload, "wanted");
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_each_publish() {
        let backbone = MemoryBackbone::new();
        let mut rx_a = backbone
            .subscribe(vec!["relay.sync".to_string()])
            .await
            .unwrap();
        let mut rx_b = backbone
            .subscribe(vec!["relay.sync".to_string()])
            .await
            .unwrap();

        backbone
            .publish("relay.sync", "frame".to_string())
            .await
            .unwrap();

        assert_eq!(rx_a.recv().await.unwrap().payload, "frame");
        assert_eq!(rx_b.recv().await.unwrap().payload, "frame");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let backbone = MemoryBackbone::new();
        assert!(backbone
            .publish("relay.events", "dropped".to_string())
            .await
            .is_ok());
    }
}
