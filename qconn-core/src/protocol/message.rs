use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use thiserror::Error;

use super::ids::is_wire_id;
use crate::error::{ErrorCode, RpcError};
use crate::operation::OpCode;

/// Messages exchanged by two connected peers.
///
/// Ids are written from the sender's point of view; the receiver negates
/// them before looking anything up. Values (`args`, `value`, object
/// representations) are QSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Apply `op` to the value at `to`; the reply goes to answer `from`.
    Dispatch {
        to: i64,
        from: i64,
        op: OpCode,
        #[serde(default)]
        args: Vec<JsonValue>,
    },

    Resolve {
        id: i64,
        #[serde(default)]
        value: JsonValue,
    },

    Reject {
        id: i64,
        #[serde(deserialize_with = "lenient_error")]
        error: RpcError,
    },

    /// A batch of copied containers, keyed by export id.
    Objects {
        #[serde(deserialize_with = "export_keys")]
        objects: BTreeMap<i64, JsonValue>,
    },

    /// The question `id` is a permanent handle and will not be resolved.
    Pass { id: i64 },
}

const MESSAGE_TYPES: [&str; 5] = ["dispatch", "resolve", "reject", "objects", "pass"];

impl Message {
    /// Parse a message from a JSON value
    pub fn from_json(value: &JsonValue) -> Result<Self, MessageError> {
        let obj = value.as_object().ok_or(MessageError::NotAnObject)?;
        let kind = obj
            .get("type")
            .and_then(JsonValue::as_str)
            .ok_or(MessageError::MissingType)?;
        if !MESSAGE_TYPES.contains(&kind) {
            return Err(MessageError::UnknownType(kind.to_string()));
        }
        let message: Message =
            serde_json::from_value(value.clone()).map_err(|source| MessageError::Malformed {
                kind: kind.to_string(),
                source,
            })?;
        if let Some(id) = message.wire_ids().find(|id| !is_wire_id(*id)) {
            return Err(MessageError::InvalidId(id));
        }
        Ok(message)
    }

    /// Convert a message to JSON
    pub fn to_json(&self) -> Result<JsonValue, MessageError> {
        serde_json::to_value(self).map_err(MessageError::Serialize)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Dispatch { .. } => "dispatch",
            Message::Resolve { .. } => "resolve",
            Message::Reject { .. } => "reject",
            Message::Objects { .. } => "objects",
            Message::Pass { .. } => "pass",
        }
    }

    /// The slot the message addresses, in the sender's frame.
    pub fn addressed_id(&self) -> Option<i64> {
        match self {
            Message::Dispatch { to, .. } => Some(*to),
            Message::Resolve { id, .. } | Message::Reject { id, .. } | Message::Pass { id } => {
                Some(*id)
            }
            Message::Objects { .. } => None,
        }
    }

    fn wire_ids(&self) -> Box<dyn Iterator<Item = i64> + '_> {
        match self {
            Message::Dispatch { to, from, .. } => Box::new([*to, *from].into_iter()),
            Message::Resolve { id, .. } | Message::Reject { id, .. } | Message::Pass { id } => {
                Box::new(std::iter::once(*id))
            }
            Message::Objects { objects } => Box::new(objects.keys().copied()),
        }
    }
}

// Map keys arrive as strings; the tagged-enum buffer will not coerce them.
fn export_keys<'de, D>(deserializer: D) -> Result<BTreeMap<i64, JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, JsonValue>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            key.parse::<i64>()
                .map(|id| (id, value))
                .map_err(|_| serde::de::Error::custom(format!("invalid export id: {}", key)))
        })
        .collect()
}

fn lenient_error<'de, D>(deserializer: D) -> Result<RpcError, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(error_from_json)
}

/// Reads an error record. Peers that send something else still produce an
/// error; the raw payload is kept as data.
pub fn error_from_json(raw: JsonValue) -> RpcError {
    if let Ok(error) = serde_json::from_value::<RpcError>(raw.clone()) {
        return error;
    }
    let message = match &raw {
        JsonValue::String(s) => s.clone(),
        JsonValue::Object(map) => map
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("remote error")
            .to_string(),
        other => other.to_string(),
    };
    RpcError::with_data(ErrorCode::Internal, message, raw)
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message must be a JSON object")]
    NotAnObject,

    #[error("Message type must be a string")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Id {0} cannot be read in the receiver's frame")]
    InvalidId(i64),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
}
