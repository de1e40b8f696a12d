//! Transport abstraction shared by the stdio, SSE, and streamable-HTTP
//! upstream transports.
//!
//! Mirrors the event-driven MCP transport pattern: a [`Transport`] delivers
//! bytes, a [`MessageHandler`] owns protocol semantics for what arrives. The
//! lifecycle worker is the handler's owner; the notification/progress router
//! is the handler's implementation.
//!
//! # Examples
//!
//! ```rust
//! use mcp_upstream_mux::protocol::{MessageHandler, JsonRpcMessage, MessageContext, TransportError};
//! use async_trait::async_trait;
//!
//! struct EchoHandler;
//!
//! #[async_trait]
//! impl MessageHandler<()> for EchoHandler {
//!     async fn handle_message(&self, message: JsonRpcMessage, _context: MessageContext<()>) {
//!         println!("Received message: {:?}", message);
//!     }
//!
//!     async fn handle_error(&self, error: TransportError) {
//!         eprintln!("Transport error: {:?}", error);
//!     }
//!
//!     async fn handle_close(&self) {
//!         println!("Transport closed");
//!     }
//! }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::message::JsonRpcMessage;

/// Errors raised by a transport implementation, distinct from the JSON-RPC
/// message-level errors carried inside a well-formed response.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("I/O error: {source}")]
    Io { source: std::io::Error },

    #[error("Serialization error: {source}")]
    Serialization { source: serde_json::Error },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// A non-2xx HTTP response, carrying the status code for 401 detection
    /// and whatever body text could be salvaged (see response-body extraction
    /// rules for streaming bodies).
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {message}")]
    Other { message: String },
}

impl TransportError {
    /// HTTP status code carried by this error, if any. Used by the operation
    /// dispatcher to detect 401 and divert to the OAuth branch.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io { source: error }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(error: serde_json::Error) -> Self {
        TransportError::Serialization { source: error }
    }
}

/// Safely extract status/body from an HTTP response, tolerating bodies that
/// cannot be (re)read because the response is a streaming body.
pub fn extract_response_info(status: u16, body: Option<Result<String, std::io::Error>>) -> (u16, String) {
    let text = match body {
        Some(Ok(text)) => text,
        Some(Err(_)) => format!("[Unable to read response content - status: {status}]"),
        None => format!("[Streaming response - status: {status}]"),
    };
    (status, text)
}

/// Session and metadata carried alongside each inbound message.
#[derive(Debug, Clone)]
pub struct MessageContext<T = ()> {
    session_id: Option<String>,
    timestamp: DateTime<Utc>,
    remote_addr: Option<String>,
    metadata: HashMap<String, String>,
    transport_data: Option<T>,
}

impl<T> MessageContext<T> {
    pub fn new_with_transport_data(session_id: impl Into<String>, transport_data: T) -> Self {
        Self {
            session_id: Some(session_id.into()),
            timestamp: Utc::now(),
            remote_addr: None,
            metadata: HashMap::new(),
            transport_data: Some(transport_data),
        }
    }

    pub fn new(session_id: impl Into<String>) -> Self
    where
        T: Default,
    {
        Self {
            session_id: Some(session_id.into()),
            timestamp: Utc::now(),
            remote_addr: None,
            metadata: HashMap::new(),
            transport_data: None,
        }
    }

    pub fn without_session() -> Self
    where
        T: Default,
    {
        Self {
            session_id: None,
            timestamp: Utc::now(),
            remote_addr: None,
            metadata: HashMap::new(),
            transport_data: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn with_remote_addr(mut self, addr: String) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn transport_data(&self) -> Option<&T> {
        self.transport_data.as_ref()
    }
}

/// Handles every inbound message that is not the direct return value of a
/// caller's own request: upstream notifications, and (logged, swallowed)
/// transport failures from the background receive loop.
///
/// Implementations must never let `handle_error` propagate a panic or
/// re-raise — a failing receive loop is reaped by the registry on the next
/// operation, not by tearing down the worker's task from inside the handler.
#[async_trait]
pub trait MessageHandler<T = ()>: Send + Sync {
    async fn handle_message(&self, message: JsonRpcMessage, context: MessageContext<T>);
    async fn handle_error(&self, error: TransportError);
    async fn handle_close(&self);
}

/// A bidirectional channel to one upstream MCP server.
///
/// `start`/`close` bracket the transport's lifetime; `send` pushes a request
/// or notification out. Inbound traffic arrives via the [`MessageHandler`]
/// registered when the transport was built, not through a `recv` method —
/// this keeps the receive loop's failure mode (a background task, possibly
/// failing independently of any in-flight `send`) visible in the type
/// signature rather than hidden behind a blocking read.
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(&mut self) -> Result<(), Self::Error>;
    async fn close(&mut self) -> Result<(), Self::Error>;
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), Self::Error>;

    fn session_id(&self) -> Option<String>;
    fn set_session_context(&mut self, session_id: Option<String>);
    fn is_connected(&self) -> bool;
    fn transport_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_response_info_handles_unread_streaming_body() {
        let (status, text) = extract_response_info(401, None);
        assert_eq!(status, 401);
        assert_eq!(text, "[Streaming response - status: 401]");
    }

    #[test]
    fn extract_response_info_handles_decode_failure() {
        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad utf8");
        let (status, text) = extract_response_info(500, Some(Err(err)));
        assert_eq!(status, 500);
        assert_eq!(text, "[Unable to read response content - status: 500]");
    }

    #[test]
    fn transport_error_http_status_is_extracted() {
        let err = TransportError::Http {
            status: 401,
            body: "unauthorized".into(),
        };
        assert_eq!(err.http_status(), Some(401));
    }
}
