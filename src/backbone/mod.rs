//! Shared pub/sub backbone.
//!
//! The backbone carries two channels: [`EVENT_CHANNEL`], the single
//! well-known channel the backend publishes fan-out envelopes to, and
//! [`SYNC_CHANNEL`], the internal channel relay instances use to reach
//! each other's connections. The trait keeps both behind one seam so the
//! whole relay can run against an in-process backbone in tests.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryBackbone;
pub use redis::RedisBackbone;

/// Channel the backend publishes event envelopes to.
pub const EVENT_CHANNEL: &str = "relay.events";

/// Channel relay instances publish sync frames to.
pub const SYNC_CHANNEL: &str = "relay.sync";

#[derive(Debug, Error)]
pub enum BackboneError {
    #[error("backbone unavailable: {0}")]
    Unavailable(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// One message received from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneMessage {
    pub channel: String,
    pub payload: String,
}

/// Pub/sub transport shared by all relay instances.
///
/// `subscribe` hands back a receiver immediately; implementations keep
/// the underlying subscription alive (reconnecting with backoff where
/// that applies) for as long as the receiver exists. Losing the backbone
/// degrades the relay to local-only delivery; it is never fatal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backbone: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BackboneError>;

    async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> Result<mpsc::UnboundedReceiver<BackboneMessage>, BackboneError>;
}

/// Capped exponential backoff for backbone reconnects. Starts at half a
/// second, doubles per failure, and never exceeds the cap.
pub(crate) struct ReconnectBackoff {
    current: Duration,
    base: Duration,
    cap: Duration,
}

impl ReconnectBackoff {
    pub(crate) fn new() -> Self {
        Self {
            current: Duration::from_millis(500),
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }

    /// Delay to wait before the next attempt; doubles for the one after.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}
