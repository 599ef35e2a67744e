//! Wire message: the only shape that crosses the transport, for requests and
//! responses alike. Serialized as a JSON object with camelCase keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{ requestName, requestId, data, isError, errorMessage }`.
///
/// `is_error` is true iff `error_message` is set. While encryption is active,
/// `data` (and `error_message`) carry ciphertext strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub request_name: String,
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
    pub is_error: bool,
    pub error_message: Option<String>,
}

impl WireMessage {
    pub fn new(request_name: impl Into<String>, request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_name: request_name.into(),
            request_id: request_id.into(),
            data,
            is_error: false,
            error_message: None,
        }
    }

    pub fn error(
        request_name: impl Into<String>,
        request_id: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            request_name: request_name.into(),
            request_id: request_id.into(),
            data: Value::Object(Default::default()),
            is_error: true,
            error_message: Some(error_message.into()),
        }
    }

    /// Parse an inbound payload. Anything that is not a well-formed wire
    /// message (wrong types, missing keys, or `isError` disagreeing with
    /// `errorMessage`) is rejected.
    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        let obj = value.as_object().ok_or(WireError::NotAnObject)?;
        // errorMessage must be present, even if null.
        if !obj.contains_key("errorMessage") {
            return Err(WireError::MissingErrorMessage);
        }
        let msg: WireMessage = serde_json::from_value(value.clone())?;
        if msg.is_error != msg.error_message.is_some() {
            return Err(WireError::ErrorFlagMismatch);
        }
        Ok(msg)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "requestName": self.request_name,
            "requestId": self.request_id,
            "data": self.data,
            "isError": self.is_error,
            "errorMessage": self.error_message,
        })
    }
}

/// Dispatch key of a raw inbound payload, if it has one.
pub fn request_name_of(value: &Value) -> Option<&str> {
    value.get("requestName").and_then(Value::as_str)
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("wire message must be a JSON object")]
    NotAnObject,
    #[error("wire message has no errorMessage field")]
    MissingErrorMessage,
    #[error("isError does not match errorMessage")]
    ErrorFlagMismatch,
    #[error("malformed wire message: {0}")]
    Decode(#[from] serde_json::Error),
}
