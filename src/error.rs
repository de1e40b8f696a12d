//! Operation-facing error taxonomy returned by every public method on
//! [`crate::manager::ClientManager`].
//!
//! This is distinct from [`crate::protocol::errors::ProtocolError`], which
//! covers malformed wire data below the operation layer.

use thiserror::Error;

use crate::protocol::errors::JsonRpcError;
use crate::protocol::transport::TransportError;

/// Taxonomy of failures a multiplexed operation can surface to its caller.
///
/// Variant choice drives the retry policy in [`crate::dispatcher`]: only
/// [`ManagerError::InvalidSessionId`] is retried locally; everything else
/// bubbles out of the inner wrapper after the outer wrapper's backoff sleep.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Neither a server id nor a display name resolved to a configuration entry.
    #[error("server configuration not found for: {0}")]
    ConfigNotFound(String),

    /// A 401 was observed for an operation whose result shape cannot carry an
    /// auth hint (anything other than `call_tool`/`get_prompt`/`read_resource`).
    #[error("authentication failed for server {server}: 401 unauthorized")]
    AuthenticationError {
        server: String,
        #[source]
        source: Option<Box<ManagerError>>,
    },

    /// A non-401 HTTP failure, with salvaged status/body.
    #[error("HTTP error for server {server}: {status} - {body}")]
    HttpError {
        server: String,
        status: u16,
        body: String,
    },

    /// A transport or JSON-RPC failure not otherwise classified.
    #[error("operation error for server {server}: {message}")]
    OperationError {
        server: String,
        message: String,
        #[source]
        source: Option<TransportError>,
    },

    /// The upstream server rejected the `mcp-session-id` we presented. Locally
    /// recoverable: clear the cached id and retry once.
    #[error("invalid session id for server {server}")]
    InvalidSessionId { server: String },

    /// A layer-level timeout (connect, or an explicit operation deadline) elapsed.
    #[error("operation timed out for server {server}")]
    OperationTimedOut { server: String },

    /// Cooperative cancellation was observed while the operation was in flight.
    #[error("operation cancelled for server {server}")]
    OperationCancelled { server: String },

    /// `connect_server` did not reach `ready` within its timeout.
    #[error("connection timeout for server {server}")]
    ConnectionTimeout { server: String },

    /// The transport tag in a server's configuration is not one this factory builds.
    #[error("unknown transport type for server {server}")]
    UnknownTransport { server: String },
}

impl ManagerError {
    /// Walk a transport error (and, for HTTP-family transports, any status
    /// code it carries) and classify it per the error-handling taxonomy:
    /// 401 is the caller's cue to divert to the OAuth branch, any other
    /// status becomes `HttpError`, anything else becomes `OperationError`.
    pub fn from_transport(server: &str, err: TransportError) -> Self {
        match err.http_status() {
            Some(401) => ManagerError::AuthenticationError {
                server: server.to_string(),
                source: None,
            },
            Some(status) => {
                let body = match &err {
                    TransportError::Http { body, .. } => body.clone(),
                    other => other.to_string(),
                };
                ManagerError::HttpError {
                    server: server.to_string(),
                    status,
                    body,
                }
            }
            None => ManagerError::OperationError {
                server: server.to_string(),
                message: err.to_string(),
                source: Some(err),
            },
        }
    }

    /// Classify a JSON-RPC error object returned in-band on an otherwise
    /// well-formed response. The message-text match for a stale session is a
    /// heuristic: upstream servers are not required to use a reserved error
    /// code for it, only to say so in `message`.
    pub fn from_json_rpc(server: &str, err: JsonRpcError) -> Self {
        if let Some(401) = err.http_status() {
            return ManagerError::AuthenticationError {
                server: server.to_string(),
                source: None,
            };
        }
        let lower = err.message.to_lowercase();
        if lower.contains("invalid session") || lower.contains("session not found") {
            return ManagerError::InvalidSessionId {
                server: server.to_string(),
            };
        }
        if let Some(status) = err.http_status() {
            return ManagerError::HttpError {
                server: server.to_string(),
                status,
                body: err.message,
            };
        }
        ManagerError::OperationError {
            server: server.to_string(),
            message: err.message,
            source: None,
        }
    }

    /// `true` for the one error kind the outer retry wrapper recovers from locally.
    pub fn is_invalid_session_id(&self) -> bool {
        matches!(self, ManagerError::InvalidSessionId { .. })
    }

    /// HTTP status this error carries, if classification preserved one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ManagerError::AuthenticationError { .. } => Some(401),
            ManagerError::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// A fresh, independently-owned copy of this error for handing to every
    /// caller joined on the same in-flight connect (see
    /// [`crate::registry::SessionRegistry::connect_server`]). `ManagerError`
    /// itself isn't `Clone` — the `TransportError` a couple of variants carry
    /// wraps non-`Clone` sources (`std::io::Error`, `serde_json::Error`) — so
    /// this rebuilds the variant and its classification-relevant fields and
    /// drops the source chain instead.
    pub fn shared_clone(&self) -> Self {
        match self {
            ManagerError::ConfigNotFound(server) => ManagerError::ConfigNotFound(server.clone()),
            ManagerError::AuthenticationError { server, .. } => ManagerError::AuthenticationError {
                server: server.clone(),
                source: None,
            },
            ManagerError::HttpError { server, status, body } => ManagerError::HttpError {
                server: server.clone(),
                status: *status,
                body: body.clone(),
            },
            ManagerError::OperationError { server, message, .. } => ManagerError::OperationError {
                server: server.clone(),
                message: message.clone(),
                source: None,
            },
            ManagerError::InvalidSessionId { server } => ManagerError::InvalidSessionId { server: server.clone() },
            ManagerError::OperationTimedOut { server } => ManagerError::OperationTimedOut { server: server.clone() },
            ManagerError::OperationCancelled { server } => ManagerError::OperationCancelled { server: server.clone() },
            ManagerError::ConnectionTimeout { server } => ManagerError::ConnectionTimeout { server: server.clone() },
            ManagerError::UnknownTransport { server } => ManagerError::UnknownTransport { server: server.clone() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_401_classifies_as_authentication_error() {
        let err = TransportError::Http {
            status: 401,
            body: "nope".into(),
        };
        let classified = ManagerError::from_transport("srv-A", err);
        assert!(matches!(classified, ManagerError::AuthenticationError { .. }));
        assert_eq!(classified.http_status(), Some(401));
    }

    #[test]
    fn transport_500_classifies_as_http_error() {
        let err = TransportError::Http {
            status: 500,
            body: "boom".into(),
        };
        let classified = ManagerError::from_transport("srv-A", err);
        assert!(matches!(classified, ManagerError::HttpError { status: 500, .. }));
    }

    #[test]
    fn non_http_transport_error_classifies_as_operation_error() {
        let err = TransportError::Connection {
            message: "refused".into(),
        };
        let classified = ManagerError::from_transport("srv-A", err);
        assert!(matches!(classified, ManagerError::OperationError { .. }));
    }
}
