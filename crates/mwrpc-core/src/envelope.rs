//! Wire envelope and handshake messages.
//!
//! Every frame on the connection is one JSON object:
//!
//! ```text
//! {"msg": "method", "id": "7", "method": "pool.query", "params": [...]}
//! {"msg": "result", "id": "7", "result": ...}
//! {"msg": "result", "id": "7", "error": {"code": 2, "message": "...", "reason": "...", "type": "..."}}
//! {"msg": "changed", "collection": "core.get_jobs", "id": 41, "fields": {...}}
//! ```
//!
//! The connect handshake uses its own small pair of messages
//! ([`ConnectRequest`] / [`ConnectReply`]) before any envelope is exchanged.

use crate::config::ProtocolConfig;
use crate::error::{Result, RpcError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// `msg` value on outgoing calls.
pub const MSG_METHOD: &str = "method";
/// `msg` value on call responses.
pub const MSG_RESULT: &str = "result";
pub const MSG_PING: &str = "ping";
pub const MSG_PONG: &str = "pong";

/// Error descriptor carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    #[serde(default, alias = "error")]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ErrorDescriptor {
    /// Build a descriptor with only a code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            reason: None,
            kind: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kind) = &self.kind {
            write!(f, "{}: ", kind)?;
        }
        let reason = self.reason.as_deref().filter(|r| !r.is_empty());
        match (self.message.is_empty(), reason) {
            (false, Some(reason)) if reason != self.message => {
                write!(f, "{} ({})", self.message, reason)?
            }
            (false, _) => write!(f, "{}", self.message)?,
            (true, Some(reason)) => write!(f, "{}", reason)?,
            (true, None) => write!(f, "remote error")?,
        }
        write!(f, " [code {}]", self.code)
    }
}

/// One frame of the request/response protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
    /// `Some(Value::Null)` when the peer sent `"result": null`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
}

/// Distinguish an explicit `null` from a missing field.
fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Accept string or numeric ids; notifications carry numeric ones.
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "id must be a string or number, got {}",
            other
        ))),
    }
}

impl Envelope {
    /// Create an outgoing call.
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            msg: Some(MSG_METHOD.to_string()),
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(params),
            ..Self::default()
        }
    }

    /// Create a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            msg: Some(MSG_RESULT.to_string()),
            id: Some(id.into()),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Create an error response.
    pub fn failure(id: impl Into<String>, error: ErrorDescriptor) -> Self {
        Self {
            msg: Some(MSG_RESULT.to_string()),
            id: Some(id.into()),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Serialize to the bytes of one frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse one frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| RpcError::decode("envelope", e))
    }

    /// Whether this frame answers a call rather than announcing an event.
    pub fn is_response(&self) -> bool {
        match self.msg.as_deref() {
            Some(msg) => msg == MSG_RESULT,
            None => self.id.is_some() && (self.result.is_some() || self.error.is_some()),
        }
    }

    /// Turn a response into the call outcome.
    ///
    /// A response must carry exactly one of `result` and `error`.
    pub fn into_outcome(self) -> Result<Value> {
        match (self.result, self.error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(RpcError::Remote(error)),
            (Some(_), Some(_)) => Err(RpcError::protocol(
                "response carries both result and error",
            )),
            (None, None) => Err(RpcError::protocol(
                "response carries neither result nor error",
            )),
        }
    }
}

/// Event frame forwarded to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub msg: String,
    pub collection: Option<String>,
    pub id: Option<String>,
    pub fields: Option<Value>,
}

impl From<Envelope> for Notification {
    fn from(envelope: Envelope) -> Self {
        Self {
            msg: envelope.msg.unwrap_or_default(),
            collection: envelope.collection,
            id: envelope.id,
            fields: envelope.fields,
        }
    }
}

/// First frame sent on a new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub msg: String,
    pub version: String,
    pub support: Vec<String>,
}

impl ConnectRequest {
    pub fn new() -> Self {
        Self {
            msg: "connect".to_string(),
            version: ProtocolConfig::VERSION.to_string(),
            support: ProtocolConfig::SUPPORTED_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

impl Default for ConnectRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Server answer to [`ConnectRequest`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectReply {
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ConnectReply {
    /// Extract the session id, failing unless the server signalled success
    /// with a non-empty session.
    pub fn into_session(self) -> Result<String> {
        match self.msg.as_deref() {
            Some("connected") => match self.session {
                Some(session) if !session.is_empty() => Ok(session),
                _ => Err(RpcError::Handshake {
                    message: "server reply carries no session identifier".to_string(),
                }),
            },
            Some("failed") => Err(RpcError::Handshake {
                message: format!(
                    "server rejected protocol version, it speaks {}",
                    self.version.as_deref().unwrap_or("an unknown version")
                ),
            }),
            Some(other) => Err(RpcError::Handshake {
                message: format!("unexpected handshake reply '{}'", other),
            }),
            None => Err(RpcError::Handshake {
                message: "handshake reply has no msg field".to_string(),
            }),
        }
    }
}
