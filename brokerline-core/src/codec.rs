use crate::errors::{DecodeError, EncodeError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";

/// Body bytes plus the content type they were produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Converts between message bodies and payload values.
///
/// Implementations must be deterministic: encoding the same value twice
/// yields the same bytes, and `decode(encode(v))` yields `v` back.
pub trait Codec: Send + Sync + 'static {
    fn decode(&self, body: &[u8], content_type: Option<&str>) -> Result<Value, DecodeError>;

    fn encode(&self, payload: &Value) -> Result<Encoded, EncodeError>;
}

/// Default codec.
///
/// Strings travel as `text/plain`, `null` as an empty body, everything else
/// as JSON. Bodies with no content type are sniffed: JSON first, then UTF-8
/// text, then raw bytes as an array of numbers.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, body: &[u8], content_type: Option<&str>) -> Result<Value, DecodeError> {
        let Some(content_type) = content_type.map(media_type) else {
            return Ok(sniff(body));
        };

        if content_type == APPLICATION_JSON || content_type.ends_with("+json") {
            serde_json::from_slice(body).map_err(|err| DecodeError::Malformed {
                content_type: content_type.to_string(),
                message: err.to_string(),
            })
        } else if content_type.starts_with("text/") {
            String::from_utf8(body.to_vec())
                .map(Value::String)
                .map_err(|err| DecodeError::Malformed {
                    content_type: content_type.to_string(),
                    message: err.to_string(),
                })
        } else {
            Ok(bytes(body))
        }
    }

    fn encode(&self, payload: &Value) -> Result<Encoded, EncodeError> {
        Ok(match payload {
            Value::Null => Encoded {
                body: Vec::new(),
                content_type: None,
            },
            Value::String(text) => Encoded {
                body: text.as_bytes().to_vec(),
                content_type: Some(TEXT_PLAIN.to_string()),
            },
            other => Encoded {
                body: serde_json::to_vec(other)?,
                content_type: Some(APPLICATION_JSON.to_string()),
            },
        })
    }
}

/// Serialize a typed payload into the value form codecs work on.
pub fn to_payload<T>(payload: &T) -> Result<Value, EncodeError>
where
    T: Serialize + ?Sized,
{
    Ok(serde_json::to_value(payload)?)
}

/// Read a typed payload out of a decoded value without cloning it.
pub fn from_payload<T>(value: &Value) -> Result<T, DecodeError>
where
    T: DeserializeOwned,
{
    T::deserialize(value).map_err(|err| DecodeError::Type {
        expected: std::any::type_name::<T>(),
        message: err.to_string(),
    })
}

fn media_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

fn sniff(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = serde_json::from_slice(body) {
        return value;
    }
    match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => bytes(body),
    }
}

fn bytes(body: &[u8]) -> Value {
    Value::Array(body.iter().map(|byte| Value::from(*byte)).collect())
}
