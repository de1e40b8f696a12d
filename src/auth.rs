//! Reactive OAuth: what happens when an upstream server answers with a 401.
//!
//! This manager never drives a browser itself. A 401 surfaces as a
//! same-shaped successful result carrying an authorization URL the caller
//! (the one downstream client) is expected to open; completing the flow and
//! supplying the resulting token back to the relevant [`crate::config::AuthConfig`]
//! is out of scope here, the same way it's out of scope for the upstream
//! server to know or care how its own OAuth provider was reached.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::AuthConfig;

/// Outcome of starting (or re-starting) an OAuth flow for a server. Unlike
/// most of this crate's results, failing to start a flow is not itself an
/// error the caller propagates — it's folded into this same enum so the
/// dispatcher can hand the downstream client a same-shaped "here's what
/// happened" result either way.
#[derive(Debug, Clone, PartialEq)]
pub enum OAuthFlowResult {
    /// The caller must send the downstream user to `authorize_url`; `state`
    /// is an opaque nonce the eventual callback should echo back.
    AuthorizationRequired { authorize_url: url::Url, state: String },
    /// The flow could not be started — no authorize endpoint configured, an
    /// invalid client registration, or similar. `error` is a short
    /// human-readable reason, not a wire-level error code.
    Failed { error: String },
}

/// Starts an OAuth authorization-code flow for a server whose upstream
/// session just reported 401. Implementations that actually exchange a code
/// for a token would plug in here; the one shipped in this crate only
/// builds the redirect.
///
/// The signature mirrors what a server-side auth broker typically exposes:
/// enough identity (`server_name`, `server_url`, `user_id`) to look up or
/// create a client registration, a `callback_url` the provider should
/// redirect back to, and any `headers` the broker should forward to the
/// provider. `auth_config` is this crate's own extra: the static client
/// registration a [`RedirectAuthManager`] needs that a real broker would
/// instead look up by `server_name`/`user_id`.
#[async_trait]
pub trait AuthManager: Send + Sync {
    async fn initiate_oauth_flow(
        &self,
        server_name: &str,
        server_url: &str,
        user_id: Option<&str>,
        callback_url: &str,
        headers: &HashMap<String, String>,
        auth_config: Option<&AuthConfig>,
    ) -> OAuthFlowResult;
}

/// Builds an authorization-code redirect URL from a server's static
/// [`crate::config::AuthConfig`]. Does not talk to the provider; it is the
/// provider's own authorize endpoint that the caller is handed a link to.
pub struct RedirectAuthManager;

#[async_trait]
impl AuthManager for RedirectAuthManager {
    async fn initiate_oauth_flow(
        &self,
        _server_name: &str,
        _server_url: &str,
        _user_id: Option<&str>,
        _callback_url: &str,
        _headers: &HashMap<String, String>,
        auth_config: Option<&AuthConfig>,
    ) -> OAuthFlowResult {
        let Some(auth) = auth_config else {
            return OAuthFlowResult::Failed {
                error: "server has no auth configuration".to_string(),
            };
        };
        let Some(authorize_url) = auth.authorize_url.clone() else {
            return OAuthFlowResult::Failed {
                error: "server's auth configuration has no authorize_url".to_string(),
            };
        };

        let state = Uuid::new_v4().to_string();
        let mut url = authorize_url;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("state", &state);
            if let Some(client_id) = &auth.client_id {
                query.append_pair("client_id", client_id);
            }
            if !auth.scopes.is_empty() {
                query.append_pair("scope", &auth.scopes.join(" "));
            }
        }

        OAuthFlowResult::AuthorizationRequired { authorize_url: url, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MCPServerConfig, TransportKind};
    use std::collections::HashMap as Map;

    fn config_with_auth() -> MCPServerConfig {
        MCPServerConfig::new(
            "srv-1",
            "protected",
            TransportKind::Http {
                url: "https://example.com/mcp".parse().unwrap(),
                headers: Map::new(),
            },
        )
        .with_auth(AuthConfig {
            client_id: Some("client-123".into()),
            client_secret: None,
            token_url: Some("https://example.com/oauth/token".parse().unwrap()),
            authorize_url: Some("https://example.com/oauth/authorize".parse().unwrap()),
            scopes: vec!["mcp:tools".into()],
            access_token: None,
        })
    }

    #[tokio::test]
    async fn builds_authorize_url_with_state_and_scopes() {
        let manager = RedirectAuthManager;
        let config = config_with_auth();
        let result = manager
            .initiate_oauth_flow(
                &config.name,
                &config.transport.endpoint(),
                None,
                "https://manager.example.com/api/otherservers/oauth/callback",
                &Map::new(),
                config.auth.as_ref(),
            )
            .await;
        let OAuthFlowResult::AuthorizationRequired { authorize_url, state } = result else {
            panic!("expected AuthorizationRequired");
        };
        assert!(!state.is_empty());
        let query: Map<_, _> = authorize_url.query_pairs().into_owned().collect();
        assert_eq!(query.get("client_id").unwrap(), "client-123");
        assert_eq!(query.get("scope").unwrap(), "mcp:tools");
        assert_eq!(query.get("state").unwrap(), &state);
    }

    #[tokio::test]
    async fn missing_auth_config_is_a_failed_result_not_an_error() {
        let manager = RedirectAuthManager;
        let config = MCPServerConfig::new(
            "srv-2",
            "unprotected",
            TransportKind::Http {
                url: "https://example.com/mcp".parse().unwrap(),
                headers: Map::new(),
            },
        );
        let result = manager
            .initiate_oauth_flow(
                &config.name,
                &config.transport.endpoint(),
                None,
                "https://manager.example.com/api/otherservers/oauth/callback",
                &Map::new(),
                config.auth.as_ref(),
            )
            .await;
        assert!(matches!(result, OAuthFlowResult::Failed { .. }));
    }
}
