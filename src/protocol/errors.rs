//! Low-level errors for malformed wire data and invalid protocol values.
//!
//! These are distinct from [`crate::error::ManagerError`], which is the
//! operation-facing taxonomy returned by public manager methods. Errors here
//! arise while constructing or parsing the JSON-RPC/MCP wire types themselves.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum ProtocolError {
    #[error("JSON-RPC error: {message}")]
    JsonRpc { message: String },

    #[error("MCP protocol error: {message}")]
    Mcp { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    #[error("Invalid base64 data")]
    InvalidBase64Data,

    #[error("Invalid protocol version: {0}")]
    InvalidProtocolVersion(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Invalid MIME type: {0}")]
    InvalidMimeType(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<TransportError> for ProtocolError {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

/// A JSON-RPC 2.0 error object, as carried in a response's `error` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// HTTP status code this JSON-RPC error is wrapping, if the transport
    /// tucked one into `data.http_status` (the shape used by this crate's
    /// HTTP-family transports when surfacing a non-2xx response as an error).
    pub fn http_status(&self) -> Option<u16> {
        self.data
            .as_ref()
            .and_then(|d| d.get("http_status"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_rpc_error_reads_http_status_from_data() {
        let err = JsonRpcError {
            code: JsonRpcError::INTERNAL_ERROR,
            message: "boom".into(),
            data: Some(serde_json::json!({"http_status": 401})),
        };
        assert_eq!(err.http_status(), Some(401));
    }
}
