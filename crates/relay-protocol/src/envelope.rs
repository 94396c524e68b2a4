//! Envelope types for the Relay protocol.
//!
//! Every message on the wire is an envelope of the shape `{t, s, d, i}`:
//! an event tag, an optional correlation value, a payload and an optional
//! human-readable note.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Outbound event tags emitted by the gateway itself.
pub mod events {
    pub const HELLO: &str = "HELLO";
    pub const READY: &str = "READY";
    pub const GUILD_INIT: &str = "GUILD_INIT";
    pub const ACK: &str = "ACK";
    pub const NOTIFICATION: &str = "NOTIFICATION";
    pub const PRESENCE_UPDATE: &str = "PRESENCE_UPDATE";
}

/// Note attached to every HELLO.
pub const HELLO_INFO: &str = "Sent once the connection is accepted, the data given will be null. \
     Please wait for the READY event before continuing with any requests.";

/// Inbound operations understood by the dispatch router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Heartbeat,
    Dispatch,
    DispatchTo,
    DispatchToGuild,
    Notification,
    Presence,
}

impl Opcode {
    /// The wire tag for this opcode.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Heartbeat => "HEARTBEAT",
            Opcode::Dispatch => "DISPATCH",
            Opcode::DispatchTo => "DISPATCH_TO",
            Opcode::DispatchToGuild => "DISPATCH_TO_GUILD",
            Opcode::Notification => "NOTIFICATION",
            Opcode::Presence => "PRESENCE",
        }
    }

    /// Whether only the trusted session may send this opcode.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            Opcode::Dispatch | Opcode::DispatchTo | Opcode::DispatchToGuild | Opcode::Notification
        )
    }
}

impl TryFrom<&str> for Opcode {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "HEARTBEAT" => Ok(Opcode::Heartbeat),
            "DISPATCH" => Ok(Opcode::Dispatch),
            "DISPATCH_TO" => Ok(Opcode::DispatchTo),
            "DISPATCH_TO_GUILD" => Ok(Opcode::DispatchToGuild),
            "NOTIFICATION" => Ok(Opcode::Notification),
            "PRESENCE" => Ok(Opcode::Presence),
            _ => Err("Unknown opcode"),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Event type tag, uppercase by convention.
    #[serde(default)]
    pub t: String,

    /// Correlation or sequence value, meaning depends on the event.
    ///
    /// `None` only when the key is absent; an explicit null is `Some(Null)`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub s: Option<Value>,

    /// Event payload.
    #[serde(default)]
    pub d: Value,

    /// Optional human-readable note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<String>,

    /// Any other top-level keys. Some producers put operation arguments here
    /// instead of in `d`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    /// Create an envelope with a tag and payload.
    #[must_use]
    pub fn new(t: impl Into<String>, d: Value) -> Self {
        Self {
            t: t.into(),
            s: None,
            d,
            i: None,
            extra: Map::new(),
        }
    }

    /// Attach a correlation value.
    #[must_use]
    pub fn with_sequence(mut self, s: impl Into<Value>) -> Self {
        self.s = Some(s.into());
        self
    }

    /// Attach an info note.
    #[must_use]
    pub fn with_info(mut self, i: impl Into<String>) -> Self {
        self.i = Some(i.into());
        self
    }

    /// Parse an inbound envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a JSON envelope.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// The arguments of an inbound operation.
    ///
    /// Top-level keys and the fields of an object `d` are merged, `d` winning
    /// on conflicts. Without top-level keys `d` is returned as is.
    #[must_use]
    pub fn into_arguments(self) -> Value {
        if self.extra.is_empty() {
            return self.d;
        }
        let mut arguments = self.extra;
        if let Value::Object(fields) = self.d {
            arguments.extend(fields);
        }
        Value::Object(arguments)
    }

    /// The opcode for this envelope's tag, if it is one the router handles.
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.t.as_str()).ok()
    }

    /// HELLO carrying the connection's correlation id.
    #[must_use]
    pub fn hello(correlation: impl Into<String>) -> Self {
        Self::new(events::HELLO, Value::Null)
            .with_sequence(correlation.into())
            .with_info(HELLO_INFO)
    }

    /// READY carrying the resolved identity, or null for the trusted session.
    #[must_use]
    pub fn ready(session_id: impl Into<String>, identity: Value) -> Self {
        Self::new(events::READY, identity).with_sequence(session_id.into())
    }

    /// GUILD_INIT carrying one group merged with its channels.
    #[must_use]
    pub fn guild_init(correlation: impl Into<String>, guild: Value) -> Self {
        Self::new(events::GUILD_INIT, guild)
            .with_sequence(correlation.into())
            .with_info("")
    }

    /// ACK echoing a heartbeat's correlation value.
    #[must_use]
    pub fn ack(s: Value) -> Self {
        Self::new(events::ACK, Value::Null).with_sequence(s)
    }

    /// A fanned-out event, the tag is uppercased.
    #[must_use]
    pub fn event(name: &str, data: Value) -> Self {
        Self::new(name.to_uppercase(), data)
    }
}

/// Payload of `DISPATCH`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatchPayload {
    #[serde(alias = "event_name")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of `DISPATCH_TO`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatchToPayload {
    #[serde(alias = "user_id", alias = "_id")]
    pub user: String,
    #[serde(alias = "event_name")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of `DISPATCH_TO_GUILD`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildDispatchPayload {
    pub guild_id: String,
    #[serde(alias = "event_name")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of `NOTIFICATION`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationPayload {
    #[serde(alias = "user_id", alias = "_id")]
    pub user: String,
    #[serde(rename = "type", default)]
    pub kind: Value,
    #[serde(default)]
    pub excerpt: Value,
}

impl NotificationPayload {
    /// The normalized envelope delivered to the user's connections.
    #[must_use]
    pub fn into_event(self) -> Envelope {
        Envelope::new(
            events::NOTIFICATION,
            serde_json::json!({ "type": self.kind, "excerpt": self.excerpt }),
        )
    }
}
