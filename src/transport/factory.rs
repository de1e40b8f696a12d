//! Builds the concrete [`Transport`] a server's configuration calls for.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{MCPServerConfig, TransportKind};
use crate::error::ManagerError;
use crate::protocol::transport::{MessageHandler, Transport, TransportError};
use crate::protocol::types::ProtocolVersion;

use super::adapters::{HttpTransport, SseTransport, StdioTransport};

/// Merge the mandatory outbound headers onto a transport's configured
/// headers: `mcp-protocol-version` unconditionally, `Authorization: Bearer
/// <token>` when the server has a cached access token, and `mcp-session-id`
/// when a prior handshake left one cached on the config. Transport-specific
/// headers already present in `base` take precedence on key collision, since
/// they are the more specific layer.
fn compose_headers(base: &HashMap<String, String>, config: &MCPServerConfig) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("mcp-protocol-version".to_string(), ProtocolVersion::current().to_string());
    if let Some(access_token) = config.auth.as_ref().and_then(|auth| auth.access_token.as_ref()) {
        headers.insert("Authorization".to_string(), format!("Bearer {access_token}"));
    }
    if let Some(session_id) = &config.session_id {
        headers.insert("mcp-session-id".to_string(), session_id.clone());
    }
    headers.extend(base.clone());
    headers
}

/// Build a transport for `config`, wired to deliver everything it receives
/// to `handler`. The transport is constructed but not yet started — the
/// lifecycle worker calls [`Transport::start`] as the next step of its
/// acquisition sequence, so a failure there unwinds cleanly rather than
/// racing a transport that's already reading in the background.
pub fn build(
    config: &MCPServerConfig,
    handler: Arc<dyn MessageHandler<()>>,
) -> Result<Box<dyn Transport<Error = TransportError> + Send>, ManagerError> {
    let transport: Box<dyn Transport<Error = TransportError> + Send> = match &config.transport {
        TransportKind::Stdio { command, args, env } => Box::new(
            StdioTransport::new(command, args, env, handler)
                .map_err(|err| ManagerError::from_transport(&config.name, err))?,
        ),
        TransportKind::Sse { url, headers } => Box::new(
            SseTransport::new(url.clone(), compose_headers(headers, config), handler)
                .map_err(|err| ManagerError::from_transport(&config.name, err))?,
        ),
        TransportKind::Http { url, headers } => Box::new(
            HttpTransport::new(url.clone(), compose_headers(headers, config), handler)
                .map_err(|err| ManagerError::from_transport(&config.name, err))?,
        ),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_protocol_version_auth_and_session_headers() {
        let mut config = MCPServerConfig::new(
            "srv-1",
            "protected",
            TransportKind::Http {
                url: "https://example.com/mcp".parse().unwrap(),
                headers: HashMap::new(),
            },
        )
        .with_auth(crate::config::AuthConfig {
            access_token: Some("tok-123".into()),
            ..Default::default()
        });
        config.session_id = Some("sess-abc".into());

        let headers = compose_headers(&HashMap::new(), &config);
        assert_eq!(headers.get("mcp-protocol-version").unwrap(), ProtocolVersion::CURRENT);
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer tok-123");
        assert_eq!(headers.get("mcp-session-id").unwrap(), "sess-abc");
    }

    #[test]
    fn transport_specific_headers_win_on_collision() {
        let config = MCPServerConfig::new(
            "srv-1",
            "custom",
            TransportKind::Http {
                url: "https://example.com/mcp".parse().unwrap(),
                headers: HashMap::new(),
            },
        );
        let mut base = HashMap::new();
        base.insert("mcp-protocol-version".to_string(), "2024-01-01".to_string());

        let headers = compose_headers(&base, &config);
        assert_eq!(headers.get("mcp-protocol-version").unwrap(), "2024-01-01");
    }

    #[test]
    fn omits_auth_and_session_headers_when_absent() {
        let config = MCPServerConfig::new(
            "srv-1",
            "plain",
            TransportKind::Http {
                url: "https://example.com/mcp".parse().unwrap(),
                headers: HashMap::new(),
            },
        );
        let headers = compose_headers(&HashMap::new(), &config);
        assert!(!headers.contains_key("Authorization"));
        assert!(!headers.contains_key("mcp-session-id"));
    }
}
