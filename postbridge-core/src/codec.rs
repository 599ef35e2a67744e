//! Codec: structured data <-> plaintext bytes, ciphertext bytes <-> transportable text.
//! Only used while a session is encrypting; plain messages cross the transport as JSON values.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;

/// Serialize a value to its canonical text form (compact JSON) and encode as UTF-8.
pub fn to_plaintext(data: &Value) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(data).map_err(CodecError::Json)
}

/// Inverse of [`to_plaintext`]. Zero bytes decode to `Value::Null` instead of a parse error.
pub fn from_plaintext(bytes: &[u8]) -> Result<Value, CodecError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::Utf8)?;
    serde_json::from_str(text).map_err(CodecError::Json)
}

/// Ciphertext bytes to the string carried in a wire message's `data` / `errorMessage`.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD.decode(text).map_err(CodecError::Base64)
}

/// Key material in exported keys uses the unpadded URL-safe alphabet.
pub fn encode_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode_base64url(text: &str) -> Result<Vec<u8>, CodecError> {
    URL_SAFE_NO_PAD.decode(text).map_err(CodecError::Base64)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("plaintext is not valid UTF-8")]
    Utf8,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
