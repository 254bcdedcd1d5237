// Serializer Port - payload wire format

use serde_json::Value;

use crate::error::{BusError, Result};

/// Converts message content to and from wire bytes
pub trait WireSerializer: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Value;
}

/// JSON for records, raw bytes for strings
///
/// Strings are written unencoded so non-JSON consumers can read them. On the
/// way back anything that does not parse as JSON is handed over as a string.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWireSerializer;

impl WireSerializer for JsonWireSerializer {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Object(_) => Ok(serde_json::to_vec(value)?),
            other => Err(BusError::Serialization(format!(
                "Cannot serialize {}: only strings and objects go on the wire",
                kind(other)
            ))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
