//! JSON payload codec.
//!
//! Message payloads are opaque `serde_json::Value`s. Typed handlers and typed
//! remote functions go through this codec on both ends.
//!
//! Named operations carry their arguments as a JSON array. [`JsonCodec::encode_args`]
//! turns a tuple into that array (wrapping a lone non-array value), and
//! [`JsonCodec::decode`] accepts a one-element array for a non-sequence target.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// JSON codec for message payloads.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value into a payload.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Encode call arguments into the array carried by an operation invocation.
    pub fn encode_args<T: Serialize>(args: &T) -> Result<Vec<Value>> {
        match serde_json::to_value(args)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            single => Ok(vec![single]),
        }
    }

    /// Decode a payload into a typed value.
    ///
    /// A one-element array that does not decode as `T` is retried as its
    /// sole element, and an empty one as `null`, mirroring
    /// [`JsonCodec::encode_args`].
    pub fn decode<T: DeserializeOwned>(payload: Value) -> Result<T> {
        match payload {
            Value::Array(items) if items.is_empty() => {
                match serde_json::from_value::<T>(Value::Array(Vec::new())) {
                    Ok(v) => Ok(v),
                    Err(_) => Ok(serde_json::from_value(Value::Null)?),
                }
            }
            Value::Array(mut items) if items.len() == 1 => {
                match serde_json::from_value::<T>(Value::Array(items.clone())) {
                    Ok(v) => Ok(v),
                    Err(_) => Ok(serde_json::from_value(items.remove(0))?),
                }
            }
            other => Ok(serde_json::from_value(other)?),
        }
    }
}
