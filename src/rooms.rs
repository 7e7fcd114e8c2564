//! Room membership registry.
//!
//! A room is nothing but the set of connections currently registered to
//! it: it appears on first join and is gone when the last member leaves.
//! Membership is tracked per namespace; the same key string in two
//! namespaces names two unrelated rooms.
//!
//! The registry is sharded concurrent state (`dashmap`); unrelated rooms
//! never contend on a common lock.

use dashmap::{DashMap, DashSet};

use crate::connection::ConnectionId;
use crate::protocol::Namespace;

type RoomKey = (Namespace, String);

/// Tracks which connections belong to which rooms, plus the reverse
/// index used to release everything a connection holds on disconnect.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomKey, DashSet<ConnectionId>>,
    memberships: DashMap<ConnectionId, DashSet<RoomKey>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room. Joining a room the connection already
    /// belongs to is a no-op.
    pub fn join(&self, namespace: Namespace, room: &str, conn: ConnectionId) {
        let key = (namespace, room.to_string());
        self.rooms.entry(key.clone()).or_default().insert(conn);
        self.memberships.entry(conn).or_default().insert(key);
    }

    /// Remove a connection from a room. Leaving a room the connection is
    /// not in is a no-op.
    pub fn leave(&self, namespace: Namespace, room: &str, conn: ConnectionId) {
        let key = (namespace, room.to_string());
        if let Some(members) = self.rooms.get(&key) {
            members.remove(&conn);
        }
        // Empty rooms are pruned so the map does not grow without bound.
        self.rooms.remove_if(&key, |_, members| members.is_empty());

        if let Some(joined) = self.memberships.get(&conn) {
            joined.remove(&key);
        }
        self.memberships.remove_if(&conn, |_, joined| joined.is_empty());
    }

    /// Drop every membership a connection holds. Returns the rooms it was
    /// in, namespace-tagged, so the caller can stash them for grace-window
    /// recovery.
    pub fn leave_all(&self, conn: ConnectionId) -> Vec<RoomKey> {
        let Some((_, joined)) = self.memberships.remove(&conn) else {
            return Vec::new();
        };

        let keys: Vec<RoomKey> = joined.into_iter().collect();
        for key in &keys {
            if let Some(members) = self.rooms.get(key) {
                members.remove(&conn);
            }
            self.rooms.remove_if(key, |_, members| members.is_empty());
        }
        keys
    }

    /// Snapshot of a room's current members.
    pub fn members(&self, namespace: Namespace, room: &str) -> Vec<ConnectionId> {
        let key = (namespace, room.to_string());
        match self.rooms.get(&key) {
            Some(members) => members.iter().map(|id| *id).collect(),
            None => Vec::new(),
        }
    }

    pub fn is_member(&self, namespace: Namespace, room: &str, conn: ConnectionId) -> bool {
        let key = (namespace, room.to_string());
        self.rooms
            .get(&key)
            .is_some_and(|members| members.contains(&conn))
    }

    /// Number of rooms with at least one member, across all namespaces.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
