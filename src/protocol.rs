//! Wire contracts: namespaces, backend envelopes, client control
//! messages, and the frames the relay emits.
//!
//! Everything crossing a process boundary is validated here, at the edge,
//! so payload shape errors surface at parse time instead of propagating
//! into the fan-out path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Static partition of connections. Each namespace authenticates
/// independently and carries its own event vocabulary; room state is
/// never shared across namespaces even when key strings collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Notifications,
    Messages,
    Contracts,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Notifications => "notifications",
            Namespace::Messages => "messages",
            Namespace::Contracts => "contracts",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notifications" => Ok(Namespace::Notifications),
            "messages" => Ok(Namespace::Messages),
            "contracts" => Ok(Namespace::Contracts),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("malformed JSON: {0}")]
    Malformed(String),

    #[error("missing or empty field '{0}'")]
    MissingField(&'static str),

    #[error("field 'data' must be a non-empty object")]
    InvalidData,

    #[error("unknown namespace '{0}'")]
    UnknownNamespace(String),
}

/// Raw shape of a backend publish before validation. Fields are optional
/// here so one missing key rejects the envelope instead of failing the
/// whole JSON parse with a less useful error.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    room: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// A validated fan-out instruction from the backend.
///
/// Invariant: all four fields were present and non-empty in the source
/// JSON. An envelope failing any check is discarded whole; the relay
/// never partially processes one.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub namespace: Namespace,
    pub event: String,
    pub room: String,
    pub data: Map<String, Value>,
}

impl Envelope {
    /// Parse and validate one backbone message.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let namespace = non_empty(raw.namespace, "namespace")?;
        let event = non_empty(raw.event, "event")?;
        let room = non_empty(raw.room, "room")?;

        let data = match raw.data {
            Some(Value::Object(map)) if !map.is_empty() => map,
            Some(_) => return Err(EnvelopeError::InvalidData),
            None => return Err(EnvelopeError::MissingField("data")),
        };

        let namespace = namespace
            .parse::<Namespace>()
            .map_err(|_| EnvelopeError::UnknownNamespace(namespace))?;

        Ok(Self {
            namespace,
            event,
            room,
            data,
        })
    }
}

fn non_empty(field: Option<String>, name: &'static str) -> Result<String, EnvelopeError> {
    match field {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(EnvelopeError::MissingField(name)),
    }
}

/// Control messages a client may send over an established connection.
///
/// Which variants are accepted depends on the connection's namespace; an
/// out-of-vocabulary message is logged and ignored by the relay server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "join:conversation")]
    JoinConversation { id: String },
    #[serde(rename = "leave:conversation")]
    LeaveConversation { id: String },
    #[serde(rename = "join:contract")]
    JoinContract { id: String },
    #[serde(rename = "leave:contract")]
    LeaveContract { id: String },
    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: String },
    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: String },
    #[serde(rename = "notification:read")]
    NotificationRead { id: String },
    #[serde(rename = "pong")]
    Pong,
}

/// Serialize one server-to-client frame: `{"event": ..., "data": ...}`.
pub fn event_frame(event: &str, data: &Value) -> String {
    serde_json::json!({ "event": event, "data": data }).to_string()
}

/// Inter-instance fan-out frame published on the sync channel.
///
/// `origin` lets the publishing instance skip its own frame when it comes
/// back around; `exclude` suppresses delivery to the connection that
/// triggered a directed broadcast (typing signals). Only the origin
/// instance can hold that connection, so other instances deliver to all
/// members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFrame {
    pub origin: String,
    pub namespace: Namespace,
    pub event: String,
    pub room: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Uuid>,
}
