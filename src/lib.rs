//! Real-time event relay.
//!
//! Fans backend-published domain events (contract status changes, chat
//! messages, notifications) out to connected WebSocket clients. Multiple
//! relay instances share room membership through a pub/sub backbone, so a
//! broadcast to a room reaches every member regardless of which instance
//! its connection is attached to.
//!
//! Delivery is best-effort and at-most-once: the relay never stores,
//! replays, or re-orders events. Two envelopes published to the same room
//! in quick succession may arrive in either order at different instances.

pub mod auth;
pub mod backbone;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod fanout;
pub mod gateway;
pub mod logger;
pub mod protocol;
pub mod relay;
pub mod rooms;

pub use config::Config;
pub use relay::RelayServer;
