//! Live connection tracking.
//!
//! Each WebSocket connection is represented by a [`ConnectionHandle`]
//! holding its identity, namespace, outbound channel, and liveness
//! timestamp. The table is a concurrent map so join/leave/broadcast from
//! arbitrarily many connection tasks never serialize behind a global lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::Namespace;

pub type ConnectionId = Uuid;

/// Wall-clock milliseconds since the UNIX epoch.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Frames queued for delivery to one connection's write loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Pre-serialized `{"event": ..., "data": ...}` text.
    Event(String),
    /// WebSocket protocol ping; browsers answer it automatically.
    Ping,
}

/// State for one live connection. Owned by the table; the socket tasks
/// hold only the id and the receiving half of the outbound channel.
pub struct ConnectionHandle {
    pub identity: Identity,
    pub namespace: Namespace,
    pub connected_at: i64,
    sender: mpsc::UnboundedSender<OutboundFrame>,
    last_seen: AtomicI64,
}

impl ConnectionHandle {
    pub fn new(
        identity: Identity,
        namespace: Namespace,
        sender: mpsc::UnboundedSender<OutboundFrame>,
        now_ms: i64,
    ) -> Self {
        Self {
            identity,
            namespace,
            connected_at: now_ms,
            sender,
            last_seen: AtomicI64::new(now_ms),
        }
    }

    /// Queue a frame for this connection. Returns false when the write
    /// loop has already gone away; callers treat that as a skipped
    /// delivery, not an error.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.sender.send(frame).is_ok()
    }

    /// Record inbound activity. Any frame from the client counts.
    pub fn touch(&self, now_ms: i64) {
        self.last_seen.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }
}

/// Concurrent map of live connections, keyed by connection id.
#[derive(Default)]
pub struct ConnectionTable {
    inner: DashMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ConnectionId, handle: Arc<ConnectionHandle>) {
        self.inner.insert(id, handle);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.inner.remove(id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.inner.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Queue a protocol ping to every live connection.
    pub fn ping_all(&self) {
        for entry in self.inner.iter() {
            entry.value().send(OutboundFrame::Ping);
        }
    }

    /// Ids of connections idle longer than `timeout_ms` as of `now_ms`.
    pub fn stale(&self, timeout_ms: i64, now_ms: i64) -> Vec<ConnectionId> {
        self.inner
            .iter()
            .filter(|entry| now_ms - entry.value().last_seen() > timeout_ms)
            .map(|entry| *entry.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(subject: &str) -> Identity {
        Identity {
            subject: subject.to_string(),
            email: None,
            role: None,
        }
    }

    fn attach(table: &ConnectionTable, subject: &str, now: i64) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let handle = ConnectionHandle::new(test_identity(subject), Namespace::Messages, tx, now);
        table.insert(id, Arc::new(handle));
        (id, rx)
    }

    #[test]
    fn test_send_after_receiver_dropped_reports_failure() {
        let table = ConnectionTable::new();
        let (id, rx) = attach(&table, "u1", 1_000);
        drop(rx);

        let handle = table.get(&id).unwrap();
        assert!(!handle.send(OutboundFrame::Ping));
    }

    #[test]
    fn test_stale_respects_touch() {
        let table = ConnectionTable::new();
        let (fresh, _rx1) = attach(&table, "u1", 1_000);
        let (idle, _rx2) = attach(&table, "u2", 1_000);

        table.get(&fresh).unwrap().touch(60_000);

        let stale = table.stale(10_000, 61_000);
        assert_eq!(stale, vec![idle]);
    }

    #[test]
    fn test_ping_all_reaches_every_connection() {
        let table = ConnectionTable::new();
        let (_a, mut rx_a) = attach(&table, "u1", 0);
        let (_b, mut rx_b) = attach(&table, "u2", 0);

        table.ping_all();

        assert_eq!(rx_a.try_recv().unwrap(), OutboundFrame::Ping);
        assert_eq!(rx_b.try_recv().unwrap(), OutboundFrame::Ping);
    }
}
