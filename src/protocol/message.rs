//! Wire messages.
//!
//! Every message is a JSON object tagged with a versioned `kind`:
//!
//! ```text
//! { "kind": "portwire/v1/messages/<kind>", "id": <string|number>, "data"?: <any>, "error"?: <any> }
//! ```
//!
//! Payloads (`data`, `error`) are opaque `serde_json::Value`s. Ports handed to a
//! peer during the handshake travel next to the message in the envelope's
//! transfer list, never inside the JSON.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PortwireError, Result};

/// Namespace shared by all message kinds. Bump the version segment on any
/// incompatible change; both peers must agree on it.
pub const NAMESPACE: &str = "portwire/v1/messages";

/// Kind tag constants.
pub mod kinds {
    /// Handshake announcement.
    pub const CONNECT: &str = "portwire/v1/messages/connect";
    /// Single-result call.
    pub const FUTURE_CALL: &str = "portwire/v1/messages/future_call";
    /// Successful outcome of a future call.
    pub const RESOLVED: &str = "portwire/v1/messages/resolved";
    /// Failed outcome of a future call.
    pub const REJECTED: &str = "portwire/v1/messages/rejected";
    /// Open a stream call.
    pub const STREAM_SUBSCRIBE: &str = "portwire/v1/messages/stream_subscribe";
    /// Close a stream call from the caller side.
    pub const STREAM_UNSUBSCRIBE: &str = "portwire/v1/messages/stream_unsubscribe";
    /// One stream value.
    pub const STREAM_EMIT: &str = "portwire/v1/messages/stream_emit";
    /// Natural end of a stream.
    pub const STREAM_COMPLETE: &str = "portwire/v1/messages/stream_complete";
    /// Failed end of a stream.
    pub const STREAM_ERROR: &str = "portwire/v1/messages/stream_error";
    /// Caller cancellation of a future call.
    pub const ABORT: &str = "portwire/v1/messages/abort";
    /// Named operation payload.
    pub const OPERATION_INVOKE: &str = "portwire/v1/messages/operation_invoke";
}

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connect,
    FutureCall,
    Resolved,
    Rejected,
    StreamSubscribe,
    StreamUnsubscribe,
    StreamEmit,
    StreamComplete,
    StreamError,
    Abort,
    OperationInvoke,
}

impl MessageKind {
    /// All kinds, in declaration order.
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Connect,
        MessageKind::FutureCall,
        MessageKind::Resolved,
        MessageKind::Rejected,
        MessageKind::StreamSubscribe,
        MessageKind::StreamUnsubscribe,
        MessageKind::StreamEmit,
        MessageKind::StreamComplete,
        MessageKind::StreamError,
        MessageKind::Abort,
        MessageKind::OperationInvoke,
    ];

    /// The wire tag for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Connect => kinds::CONNECT,
            MessageKind::FutureCall => kinds::FUTURE_CALL,
            MessageKind::Resolved => kinds::RESOLVED,
            MessageKind::Rejected => kinds::REJECTED,
            MessageKind::StreamSubscribe => kinds::STREAM_SUBSCRIBE,
            MessageKind::StreamUnsubscribe => kinds::STREAM_UNSUBSCRIBE,
            MessageKind::StreamEmit => kinds::STREAM_EMIT,
            MessageKind::StreamComplete => kinds::STREAM_COMPLETE,
            MessageKind::StreamError => kinds::STREAM_ERROR,
            MessageKind::Abort => kinds::ABORT,
            MessageKind::OperationInvoke => kinds::OPERATION_INVOKE,
        }
    }

    /// Parse a wire tag.
    pub fn from_wire(tag: &str) -> Option<MessageKind> {
        MessageKind::ALL.into_iter().find(|k| k.as_str() == tag)
    }

    /// Whether no further message for the same id may follow this one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageKind::Resolved
                | MessageKind::Rejected
                | MessageKind::StreamComplete
                | MessageKind::StreamError
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-chosen token identifying one outstanding call.
///
/// Numeric ids keep their exact JSON form, so any number a peer picks
/// (including ones beyond `i64` or with a fraction) is echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Num(serde_json::Number),
    Str(String),
}

macro_rules! correlation_id_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for CorrelationId {
                fn from(n: $t) -> Self {
                    CorrelationId::Num(n.into())
                }
            }
        )*
    };
}

correlation_id_from_int!(i32, i64, u32, u64);

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId::Str(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        CorrelationId::Str(s)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Num(n) => write!(f, "{}", n),
            CorrelationId::Str(s) => f.write_str(s),
        }
    }
}

/// Payload shape for calls that target a named operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInvoke {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl OperationInvoke {
    pub fn new(function: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }

    /// Encode as a tagged payload suitable for `future_call`/`stream_subscribe`.
    pub fn to_payload(&self) -> Result<Value> {
        Message::OperationInvoke(self.clone()).encode()
    }

    /// Recognise a named-operation payload.
    ///
    /// Any object with a `function` field qualifies, tagged or not. A
    /// non-string name is kept in its JSON form so the lookup misses with a
    /// readable message; a non-array `args` becomes a single argument.
    pub fn from_payload(payload: &Value) -> Option<OperationInvoke> {
        let object = payload.as_object()?;
        let function = object.get("function")?;
        let function = match function {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let args = match object.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
        };
        Some(OperationInvoke { function, args })
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    #[serde(rename = "portwire/v1/messages/connect")]
    Connect { id: String },

    #[serde(rename = "portwire/v1/messages/future_call")]
    FutureCall {
        id: CorrelationId,
        #[serde(default)]
        data: Value,
    },

    #[serde(rename = "portwire/v1/messages/resolved")]
    Resolved {
        id: CorrelationId,
        #[serde(default)]
        data: Value,
    },

    #[serde(rename = "portwire/v1/messages/rejected")]
    Rejected {
        id: CorrelationId,
        #[serde(default)]
        error: Value,
    },

    #[serde(rename = "portwire/v1/messages/stream_subscribe")]
    StreamSubscribe {
        id: CorrelationId,
        #[serde(default)]
        data: Value,
    },

    #[serde(rename = "portwire/v1/messages/stream_unsubscribe")]
    StreamUnsubscribe { id: CorrelationId },

    #[serde(rename = "portwire/v1/messages/stream_emit")]
    StreamEmit {
        id: CorrelationId,
        #[serde(default)]
        data: Value,
    },

    #[serde(rename = "portwire/v1/messages/stream_complete")]
    StreamComplete { id: CorrelationId },

    #[serde(rename = "portwire/v1/messages/stream_error")]
    StreamError {
        id: CorrelationId,
        #[serde(default)]
        error: Value,
    },

    #[serde(rename = "portwire/v1/messages/abort")]
    Abort { id: CorrelationId },

    #[serde(rename = "portwire/v1/messages/operation_invoke")]
    OperationInvoke(OperationInvoke),
}

impl Message {
    pub fn connect(id: impl Into<String>) -> Self {
        Message::Connect { id: id.into() }
    }

    pub fn future_call(id: impl Into<CorrelationId>, data: Value) -> Self {
        Message::FutureCall {
            id: id.into(),
            data,
        }
    }

    pub fn resolved(id: impl Into<CorrelationId>, data: Value) -> Self {
        Message::Resolved {
            id: id.into(),
            data,
        }
    }

    pub fn rejected(id: impl Into<CorrelationId>, error: Value) -> Self {
        Message::Rejected {
            id: id.into(),
            error,
        }
    }

    pub fn stream_subscribe(id: impl Into<CorrelationId>, data: Value) -> Self {
        Message::StreamSubscribe {
            id: id.into(),
            data,
        }
    }

    pub fn stream_unsubscribe(id: impl Into<CorrelationId>) -> Self {
        Message::StreamUnsubscribe { id: id.into() }
    }

    pub fn stream_emit(id: impl Into<CorrelationId>, data: Value) -> Self {
        Message::StreamEmit {
            id: id.into(),
            data,
        }
    }

    pub fn stream_complete(id: impl Into<CorrelationId>) -> Self {
        Message::StreamComplete { id: id.into() }
    }

    pub fn stream_error(id: impl Into<CorrelationId>, error: Value) -> Self {
        Message::StreamError {
            id: id.into(),
            error,
        }
    }

    pub fn abort(id: impl Into<CorrelationId>) -> Self {
        Message::Abort { id: id.into() }
    }

    pub fn operation_invoke(function: impl Into<String>, args: Vec<Value>) -> Self {
        Message::OperationInvoke(OperationInvoke::new(function, args))
    }

    /// The kind tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Connect { .. } => MessageKind::Connect,
            Message::FutureCall { .. } => MessageKind::FutureCall,
            Message::Resolved { .. } => MessageKind::Resolved,
            Message::Rejected { .. } => MessageKind::Rejected,
            Message::StreamSubscribe { .. } => MessageKind::StreamSubscribe,
            Message::StreamUnsubscribe { .. } => MessageKind::StreamUnsubscribe,
            Message::StreamEmit { .. } => MessageKind::StreamEmit,
            Message::StreamComplete { .. } => MessageKind::StreamComplete,
            Message::StreamError { .. } => MessageKind::StreamError,
            Message::Abort { .. } => MessageKind::Abort,
            Message::OperationInvoke(_) => MessageKind::OperationInvoke,
        }
    }

    /// Correlation id, for the kinds that carry one.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Message::FutureCall { id, .. }
            | Message::Resolved { id, .. }
            | Message::Rejected { id, .. }
            | Message::StreamSubscribe { id, .. }
            | Message::StreamUnsubscribe { id }
            | Message::StreamEmit { id, .. }
            | Message::StreamComplete { id }
            | Message::StreamError { id, .. }
            | Message::Abort { id } => Some(id),
            Message::Connect { .. } | Message::OperationInvoke(_) => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Encode to the JSON wire shape.
    pub fn encode(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from the JSON wire shape.
    ///
    /// # Errors
    ///
    /// - [`PortwireError::UnknownKind`] when `kind` is not one of ours
    /// - [`PortwireError::Protocol`] when `kind` is missing or fields are malformed
    pub fn decode(value: &Value) -> Result<Message> {
        let tag = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| PortwireError::Protocol("message has no kind".to_string()))?;

        let kind = MessageKind::from_wire(tag)
            .ok_or_else(|| PortwireError::UnknownKind(tag.to_string()))?;

        Message::deserialize(value)
            .map_err(|e| PortwireError::Protocol(format!("malformed {} message: {}", kind, e)))
    }
}
