//! Wire protocol between the sandbox and its supervisor.
//!
//! Every message in either direction is an envelope `{name, args}`.
//! Inbound envelopes are decoded into [`InboundMessage`]; outbound traffic is
//! built as [`OutboundMessage`], whose serde representation is the envelope
//! itself.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use panflux_schema::{EntityDefinition, StateDelta};

use crate::error::{Result, SandboxError};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque entity identifier, unique within a running sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl Deref for EntityId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The raw `{name, args}` frame carried by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl Envelope {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Arguments of an inbound `call` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: EntityId,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// A decoded control message from the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Start(Value),
    Stop(Value),
    Discover(Value),
    /// Raw entity definition; validated by the engine so rejections can be
    /// logged together with the offending payload.
    Adopt(Value),
    Call(CallRequest),
    ProcessChangeQueue,
    SetLogLevel(String),
    Unknown { name: String, args: Value },
}

impl InboundMessage {
    /// Decode an envelope.  Unrecognized names become [`Self::Unknown`];
    /// only malformed arguments of known messages fail.
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let Envelope { name, args } = envelope;
        Ok(match name.as_str() {
            "start" => Self::Start(args),
            "stop" => Self::Stop(args),
            "discover" => Self::Discover(args),
            "adopt" => Self::Adopt(args),
            "call" => Self::Call(
                serde_json::from_value(args).map_err(|e| invalid_payload(&name, e))?,
            ),
            "processChangeQueue" => Self::ProcessChangeQueue,
            "setLogLevel" => match args {
                Value::String(level) => Self::SetLogLevel(level),
                other => {
                    return Err(SandboxError::InvalidPayload {
                        message: name,
                        reason: format!("expected a level name, got {other}"),
                    });
                }
            },
            _ => Self::Unknown { name, args },
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Discover(_) => "discover",
            Self::Adopt(_) => "adopt",
            Self::Call(_) => "call",
            Self::ProcessChangeQueue => "processChangeQueue",
            Self::SetLogLevel(_) => "setLogLevel",
            Self::Unknown { name, .. } => name,
        }
    }

    /// The message arguments as they appeared on the wire.
    pub fn args(&self) -> Value {
        match self {
            Self::Start(args)
            | Self::Stop(args)
            | Self::Discover(args)
            | Self::Adopt(args)
            | Self::Unknown { args, .. } => args.clone(),
            Self::Call(request) => serde_json::to_value(request).unwrap_or_default(),
            Self::ProcessChangeQueue => Value::Null,
            Self::SetLogLevel(level) => Value::String(level.clone()),
        }
    }
}

impl TryFrom<Envelope> for InboundMessage {
    type Error = SandboxError;

    fn try_from(envelope: Envelope) -> Result<Self> {
        Self::from_envelope(envelope)
    }
}

fn invalid_payload(message: &str, err: serde_json::Error) -> SandboxError {
    SandboxError::InvalidPayload {
        message: message.to_owned(),
        reason: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Arguments of an outbound `event` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub name: String,
    pub entity_id: EntityId,
    pub parameters: Value,
}

/// Arguments of an outbound `pendingChanges` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChanges {
    pub entity_ids: Vec<EntityId>,
}

/// A structured log record forwarded to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

/// A message from the sandbox to its supervisor.
///
/// Serializes directly as an envelope, e.g.
/// `{"name": "pendingChanges", "args": {"entityIds": ["1"]}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "camelCase")]
pub enum OutboundMessage {
    Discovery(EntityDefinition),
    Data(StateDelta),
    Event(EventPayload),
    PendingChanges(PendingChanges),
    Log(LogRecord),
}

impl OutboundMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovery(_) => "discovery",
            Self::Data(_) => "data",
            Self::Event(_) => "event",
            Self::PendingChanges(_) => "pendingChanges",
            Self::Log(_) => "log",
        }
    }

    pub fn into_envelope(self) -> Result<Envelope> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
