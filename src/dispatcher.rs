//! Operation dispatcher: the decorator pair every public operation goes
//! through. The inner wrapper resolves configuration, connects or reuses a
//! session, invokes the operation, classifies any error (including
//! diverting a 401 into the reactive OAuth branch), and tears the session
//! down afterward if the server isn't configured to keep it alive. The
//! outer wrapper retries exactly once, only for a stale session id, by
//! clearing the cached id and reconnecting immediately — no backoff, since
//! the failure mode it's recovering from isn't transient load, it's a
//! session the upstream server has already forgotten about.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::auth::{AuthManager, OAuthFlowResult};
use crate::config::ConfigStore;
use crate::error::ManagerError;
use crate::protocol::types::{
    CallToolResult, Content, GetPromptResult, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, PromptMessage, ReadResourceResult,
};
use crate::registry::SessionRegistry;
use crate::session::{make_progress_token, JsonRpcSession, ProgressCallback};

/// One retry, and only for a stale session id — everything else propagates
/// on the first failure.
const MAX_ATTEMPTS: u32 = 2;

/// The path every outbound OAuth callback is served at, appended to the
/// manager's configured `base_url`.
const OAUTH_CALLBACK_PATH: &str = "/api/otherservers/oauth/callback";

/// A result shape that can carry "you need to sign in" without changing its
/// type — the property that lets the 401 branch be generic across
/// `call_tool`/`read_resource`/`get_prompt` but not, say, `list_tools`.
pub trait AuthHintResult: Sized {
    fn auth_hint(message: &str) -> Self;
}

impl AuthHintResult for CallToolResult {
    fn auth_hint(message: &str) -> Self {
        CallToolResult::error(vec![Content::text(message)])
    }
}

impl AuthHintResult for ReadResourceResult {
    fn auth_hint(message: &str) -> Self {
        ReadResourceResult::new(vec![Content::resource_text(
            "https://1xn.ai/auth-error",
            "text/plain",
            message,
        )])
    }
}

impl AuthHintResult for GetPromptResult {
    fn auth_hint(message: &str) -> Self {
        GetPromptResult::new(Some("Auth Error".to_string()), vec![PromptMessage::user(Content::text(message))])
    }
}

pub struct OperationDispatcher {
    registry: Arc<SessionRegistry>,
    configs: Arc<dyn ConfigStore>,
    auth: Arc<dyn AuthManager>,
    base_url: String,
}

impl OperationDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, configs: Arc<dyn ConfigStore>, auth: Arc<dyn AuthManager>, base_url: impl Into<String>) -> Self {
        Self {
            registry,
            configs,
            auth,
            base_url: base_url.into(),
        }
    }

    /// Connect-or-reuse, invoke, and tear down if the server isn't kept
    /// alive. One call of this is one attempt as far as the outer retry
    /// wrapper is concerned.
    async fn invoke<T, F, Fut>(&self, server: &str, body: &F) -> Result<T, ManagerError>
    where
        F: Fn(Arc<JsonRpcSession>) -> Fut,
        Fut: Future<Output = Result<T, ManagerError>>,
    {
        let config = self
            .configs
            .resolve(server)
            .await
            .ok_or_else(|| ManagerError::ConfigNotFound(server.to_string()))?;
        let session = self.registry.connect_server(server).await?;
        let result = body(session).await;
        if !config.keep_alive {
            if let Err(err) = self.registry.disconnect_server(server).await {
                warn!(server, %err, "failed to disconnect non-keep-alive session after operation");
            }
        }
        result
    }

    async fn with_retry<T, F, Fut>(&self, server: &str, body: F) -> Result<T, ManagerError>
    where
        F: Fn(Arc<JsonRpcSession>) -> Fut,
        Fut: Future<Output = Result<T, ManagerError>>,
    {
        let mut attempt = 1u32;
        loop {
            match self.invoke(server, &body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_invalid_session_id() && attempt < MAX_ATTEMPTS => {
                    warn!(server, attempt, "stale session id, clearing cached id and retrying");
                    if let Some(mut config) = self.configs.resolve(server).await {
                        config.session_id = None;
                        self.configs.put(config).await;
                    }
                    let _ = self.registry.disconnect_server(server).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Dispatch an operation whose result shape has no way to carry an auth
    /// hint: a 401 surfaces directly as [`ManagerError::AuthenticationError`].
    async fn dispatch<T, F, Fut>(&self, server: &str, body: F) -> Result<T, ManagerError>
    where
        F: Fn(Arc<JsonRpcSession>) -> Fut,
        Fut: Future<Output = Result<T, ManagerError>>,
    {
        self.with_retry(server, body).await
    }

    /// Dispatch an operation whose result type can represent "sign in
    /// required" in-band: a 401 starts the OAuth flow and, regardless of
    /// whether that start itself succeeds, returns a same-shaped successful
    /// result carrying a human-readable message rather than propagating the
    /// original error.
    async fn dispatch_with_auth_hint<T, F, Fut>(&self, server: &str, body: F) -> Result<T, ManagerError>
    where
        T: AuthHintResult,
        F: Fn(Arc<JsonRpcSession>) -> Fut,
        Fut: Future<Output = Result<T, ManagerError>>,
    {
        match self.with_retry(server, body).await {
            Err(err) if err.http_status() == Some(401) => {
                let config = self
                    .configs
                    .resolve(server)
                    .await
                    .ok_or_else(|| ManagerError::ConfigNotFound(server.to_string()))?;

                let server_url = config.transport.endpoint();
                let callback_url = format!("{}{OAUTH_CALLBACK_PATH}", self.base_url);
                let headers = std::collections::HashMap::new();

                let message = match self
                    .auth
                    .initiate_oauth_flow(&config.name, &server_url, None, &callback_url, &headers, config.auth.as_ref())
                    .await
                {
                    OAuthFlowResult::AuthorizationRequired { authorize_url, .. } => {
                        format!("Server {} is unauthenticated. Please authenticate using: {authorize_url}", config.name)
                    }
                    OAuthFlowResult::Failed { error } => format!("OAuth initiation failed: {error}"),
                };

                Ok(T::auth_hint(&message))
            }
            other => other,
        }
    }

    pub async fn list_tools(&self, server: &str) -> Result<ListToolsResult, ManagerError> {
        let server_owned = server.to_string();
        let mut result = self.dispatch(server, move |session| async move { session.list_tools().await }).await?;
        for tool in &mut result.tools {
            let meta = tool.meta.get_or_insert_with(serde_json::Map::new);
            meta.insert("server_name".to_string(), serde_json::Value::String(server_owned.clone()));
        }
        Ok(result)
    }

    pub async fn list_prompts(&self, server: &str) -> Result<ListPromptsResult, ManagerError> {
        self.dispatch(server, move |session| async move { session.list_prompts().await }).await
    }

    pub async fn list_resources(&self, server: &str) -> Result<ListResourcesResult, ManagerError> {
        self.dispatch(server, move |session| async move { session.list_resources().await }).await
    }

    pub async fn list_resource_templates(&self, server: &str) -> Result<ListResourceTemplatesResult, ManagerError> {
        self.dispatch(server, move |session| async move { session.list_resource_templates().await })
            .await
    }

    pub async fn call_tool(
        &self,
        server: &str,
        name: &str,
        arguments: Option<Value>,
        progress_token: Option<String>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<CallToolResult, ManagerError> {
        let name = name.to_string();
        self.dispatch_with_auth_hint(server, move |session| {
            let name = name.clone();
            let arguments = arguments.clone();
            let on_progress = on_progress.clone();
            let progress_token = progress_token.clone();
            async move {
                let progress = on_progress.map(|callback| {
                    let token = progress_token.unwrap_or_else(|| make_progress_token(session.server_name(), &name));
                    (token, callback)
                });
                session.call_tool(&name, arguments, progress).await
            }
        })
        .await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ReadResourceResult, ManagerError> {
        let uri = uri.to_string();
        self.dispatch_with_auth_hint(server, move |session| {
            let uri = uri.clone();
            async move { session.read_resource(&uri).await }
        })
        .await
    }

    pub async fn get_prompt(&self, server: &str, name: &str, arguments: Option<Value>) -> Result<GetPromptResult, ManagerError> {
        let name = name.to_string();
        self.dispatch_with_auth_hint(server, move |session| {
            let name = name.clone();
            let arguments = arguments.clone();
            async move { session.get_prompt(&name, arguments).await }
        })
        .await
    }

    /// Ping a server and, on success, record it as `Connected` in the
    /// config store — a ping is itself evidence the session is alive, so
    /// there's no reason to wait for the next real operation to refresh the
    /// status.
    pub async fn send_ping(&self, server: &str) -> Result<crate::config::ConnectionStatus, ManagerError> {
        self.dispatch(server, move |session| async move { session.send_ping().await }).await?;

        match self.configs.resolve(server).await {
            Some(config) => {
                self.configs.set_status(&config.server_id, crate::config::ConnectionStatus::Connected).await;
            }
            None => {
                warn!(server, "ping succeeded but server configuration has since disappeared; not persisting status");
            }
        }
        Ok(crate::config::ConnectionStatus::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InMemoryConfigStore, MCPServerConfig, TransportKind};
    use crate::protocol::types::{ClientCapabilities, ClientInfo};
    use crate::router::NotificationRouter;
    use std::collections::HashMap;

    fn dispatcher() -> OperationDispatcher {
        let configs = InMemoryConfigStore::new();
        let router = NotificationRouter::new();
        let registry = SessionRegistry::new(
            configs.clone(),
            router,
            ClientInfo {
                name: "test".into(),
                version: "0.0.0".into(),
            },
            ClientCapabilities::default(),
        );
        OperationDispatcher::new(registry, configs, Arc::new(crate::auth::RedirectAuthManager), "http://localhost:8080")
    }

    #[tokio::test]
    async fn missing_server_config_is_config_not_found_without_touching_the_registry() {
        let dispatcher = dispatcher();
        let err = dispatcher.send_ping("ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn connect_failure_propagates_through_list_tools_without_retrying() {
        let dispatcher = dispatcher();
        dispatcher
            .configs
            .put(MCPServerConfig::new(
                "srv-1",
                "broken",
                TransportKind::Stdio {
                    command: "definitely-not-a-real-binary-xyz".into(),
                    args: vec![],
                    env: HashMap::new(),
                },
            ))
            .await;

        let err = dispatcher.list_tools("broken").await.unwrap_err();
        // Not `InvalidSessionId`, so the outer wrapper must not have retried;
        // a spawn failure is classified as a plain operation error.
        assert!(matches!(err, ManagerError::OperationError { .. }));
    }

    #[test]
    fn call_tool_auth_hint_names_the_server_and_the_authorize_url() {
        let message = <CallToolResult as AuthHintResult>::auth_hint("Server protected is unauthenticated. Please authenticate using: https://example.com/authorize");
        assert!(message.is_error);
        let text = message.content.first().and_then(Content::as_text).unwrap();
        assert!(text.contains("Server protected is unauthenticated"));
    }

    #[test]
    fn read_resource_auth_hint_uses_the_fixed_error_uri() {
        let result = <ReadResourceResult as AuthHintResult>::auth_hint("OAuth initiation failed: boom");
        let Content::Resource { resource, text, .. } = &result.contents[0] else {
            panic!("expected a resource content block");
        };
        assert_eq!(resource.as_str(), "https://1xn.ai/auth-error");
        assert_eq!(text.as_deref(), Some("OAuth initiation failed: boom"));
    }

    #[test]
    fn get_prompt_auth_hint_uses_auth_error_description_and_user_role() {
        let result = <GetPromptResult as AuthHintResult>::auth_hint("Server protected is unauthenticated. Please authenticate using: https://example.com/authorize");
        assert_eq!(result.description.as_deref(), Some("Auth Error"));
        assert_eq!(result.messages[0].role, "user");
    }
}
