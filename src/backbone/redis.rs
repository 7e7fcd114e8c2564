//! Redis-backed backbone.
//!
//! Publishing uses a lazily-opened multiplexed connection, reopened on
//! the next publish after a failure. Subscriptions run in a background
//! task that holds a dedicated pub/sub connection and reconnects with
//! capped exponential backoff; while the backbone is down the relay
//! keeps serving local connections and every retry is logged.

use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{Backbone, BackboneError, BackboneMessage, ReconnectBackoff};

pub struct RedisBackbone {
    client: redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
    shutdown: CancellationToken,
}

impl RedisBackbone {
    /// Create a backbone for the given Redis URL. The URL is validated
    /// here; actual connections are opened on first use so a relay can
    /// start while Redis is still coming up.
    pub fn new(url: &str, shutdown: CancellationToken) -> Result<Self, BackboneError> {
        let client =
            redis::Client::open(url).map_err(|e| BackboneError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
            shutdown,
        })
    }

    async fn publisher_connection(&self) -> Result<MultiplexedConnection, BackboneError> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BackboneError::Unavailable(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_publisher(&self) {
        *self.publisher.lock().await = None;
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BackboneError> {
        let mut conn = self.publisher_connection().await?;
        let result: Result<(), redis::RedisError> = conn.publish(channel, payload).await;
        if let Err(e) = result {
            // Next publish reopens; delivery stays local-only meanwhile.
            self.drop_publisher().await;
            return Err(BackboneError::PublishFailed(e.to_string()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> Result<mpsc::UnboundedReceiver<BackboneMessage>, BackboneError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut backoff = ReconnectBackoff::new();
            loop {
                if shutdown.is_cancelled() || tx.is_closed() {
                    break;
                }

                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        let mut subscribed = true;
                        for channel in &channels {
                            if let Err(e) = pubsub.subscribe(channel).await {
                                tracing::warn!(
                                    "Failed to subscribe backbone channel '{}': {}",
                                    channel,
                                    e
                                );
                                subscribed = false;
                                break;
                            }
                        }

                        if subscribed {
                            backoff.reset();
                            tracing::info!("Backbone subscription established ({:?})", channels);

                            let mut stream = pubsub.on_message();
                            loop {
                                tokio::select! {
                                    message = stream.next() => {
                                        let Some(message) = message else {
                                            // Connection dropped; fall out to reconnect.
                                            break;
                                        };
                                        let channel = message.get_channel_name().to_string();
                                        match message.get_payload::<String>() {
                                            Ok(payload) => {
                                                if tx.send(BackboneMessage { channel, payload }).is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => {
                                                tracing::warn!(
                                                    "Discarding non-UTF8 backbone payload on '{}': {}",
                                                    channel,
                                                    e
                                                );
                                            }
                                        }
                                    }
                                    _ = shutdown.cancelled() => return,
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Backbone connection failed: {}", e);
                    }
                }

                let delay = backoff.next_delay();
                tracing::warn!(
                    "Backbone subscription lost, retrying in {:.1}s (local-only delivery until it recovers)",
                    delay.as_secs_f64()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        Ok(rx)
    }
}
