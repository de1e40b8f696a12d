//! The multiplexing client manager's public surface: one struct wiring
//! configuration storage, the session registry, the notification router,
//! and the operation dispatcher together.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::info;

use crate::auth::{AuthManager, RedirectAuthManager};
use crate::config::{ConfigStore, ConnectionStatus, InMemoryConfigStore, MCPServerConfig};
use crate::dispatcher::OperationDispatcher;
use crate::downstream::DownstreamSession;
use crate::error::ManagerError;
use crate::protocol::types::{
    CallToolResult, ClientCapabilities, ClientInfo, GetPromptResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, Prompt, ReadResourceResult, Resource, ResourceTemplate, Tool,
};
use crate::registry::SessionRegistry;
use crate::router::NotificationRouter;
use crate::session::ProgressCallback;

/// The `base_url` used when a caller doesn't supply one, matching a local
/// development deployment of the downstream client this manager serves.
const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Everything discovered from one upstream server during
/// [`ClientManager::discover_all`]. Discovery never raises on a per-category
/// failure — a server that couldn't be reached at all simply has every
/// category empty and every category represented in `errors_if_any`.
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilitySnapshot {
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    /// Keyed by category (`"tools"`, `"prompts"`, `"resources"`,
    /// `"resource_templates"`); present only for categories that failed.
    pub errors_if_any: HashMap<String, String>,
}

/// Result of discovering capabilities across every configured server. Every
/// configured server gets an entry — a server that's entirely unreachable
/// still appears, with every category's error recorded rather than the
/// server being dropped from the map.
#[derive(Debug, Default)]
pub struct DiscoverySummary {
    pub servers: HashMap<String, ServerCapabilitySnapshot>,
}

/// One downstream MCP client multiplexed across many upstream MCP servers.
pub struct ClientManager {
    configs: Arc<dyn ConfigStore>,
    registry: Arc<SessionRegistry>,
    dispatcher: OperationDispatcher,
}

impl ClientManager {
    pub fn new(client_info: ClientInfo, client_capabilities: ClientCapabilities) -> Self {
        Self::with_backing(
            client_info,
            client_capabilities,
            InMemoryConfigStore::new(),
            Arc::new(RedirectAuthManager),
            DEFAULT_BASE_URL,
        )
    }

    pub fn with_backing(
        client_info: ClientInfo,
        client_capabilities: ClientCapabilities,
        configs: Arc<dyn ConfigStore>,
        auth: Arc<dyn AuthManager>,
        base_url: impl Into<String>,
    ) -> Self {
        let router = NotificationRouter::new();
        let registry = SessionRegistry::new(configs.clone(), router, client_info, client_capabilities);
        let dispatcher = OperationDispatcher::new(registry.clone(), configs.clone(), auth, base_url);
        Self {
            configs,
            registry,
            dispatcher,
        }
    }

    /// Mark the manager started. Idempotent: a redundant call is logged and
    /// otherwise a no-op.
    pub fn start(&self) {
        self.registry.start();
    }

    /// Tear down every live upstream session. Intended for process
    /// shutdown; registered server configurations survive the call. Returns
    /// the number of sessions that were live at the moment `stop` was
    /// called.
    pub async fn stop(&self) -> usize {
        self.registry.stop().await
    }

    pub async fn register_server(&self, config: MCPServerConfig) {
        info!(server = %config.name, transport = config.transport.label(), "registering upstream server");
        self.configs.put(config).await;
    }

    pub async fn remove_server(&self, id_or_name: &str) -> Result<(), ManagerError> {
        self.disconnect_server(id_or_name).await.ok();
        self.configs.remove(id_or_name).await;
        Ok(())
    }

    pub async fn list_servers(&self) -> Vec<MCPServerConfig> {
        self.configs.list().await
    }

    pub async fn connection_status(&self, id_or_name: &str) -> Option<ConnectionStatus> {
        self.configs.status(id_or_name).await
    }

    pub async fn connect_server(&self, id_or_name: &str) -> Result<(), ManagerError> {
        self.registry.connect_server(id_or_name).await.map(|_| ())
    }

    pub async fn disconnect_server(&self, id_or_name: &str) -> Result<(), ManagerError> {
        self.registry.disconnect_server(id_or_name).await
    }

    /// Attach (or detach, with `None`) the one downstream session whose
    /// notifications every upstream server's events are routed to.
    pub async fn set_downstream_session(&self, session: Option<Arc<dyn DownstreamSession>>) {
        self.registry.set_downstream_session(session).await;
    }

    pub async fn list_tools(&self, server: &str) -> Result<ListToolsResult, ManagerError> {
        self.dispatcher.list_tools(server).await
    }

    pub async fn list_prompts(&self, server: &str) -> Result<ListPromptsResult, ManagerError> {
        self.dispatcher.list_prompts(server).await
    }

    pub async fn list_resources(&self, server: &str) -> Result<ListResourcesResult, ManagerError> {
        self.dispatcher.list_resources(server).await
    }

    pub async fn list_resource_templates(&self, server: &str) -> Result<ListResourceTemplatesResult, ManagerError> {
        self.dispatcher.list_resource_templates(server).await
    }

    pub async fn call_tool(
        &self,
        server: &str,
        name: &str,
        arguments: Option<serde_json::Value>,
        progress_token: Option<String>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<CallToolResult, ManagerError> {
        self.dispatcher.call_tool(server, name, arguments, progress_token, on_progress).await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ReadResourceResult, ManagerError> {
        self.dispatcher.read_resource(server, uri).await
    }

    pub async fn get_prompt(&self, server: &str, name: &str, arguments: Option<serde_json::Value>) -> Result<GetPromptResult, ManagerError> {
        self.dispatcher.get_prompt(server, name, arguments).await
    }

    pub async fn send_ping(&self, server: &str) -> Result<ConnectionStatus, ManagerError> {
        self.dispatcher.send_ping(server).await
    }

    /// Discover tools/resources/resource-templates/prompts across every
    /// configured server concurrently. Each category is attempted
    /// independently per server: a server that fails one category still
    /// reports the others, and a server that's entirely unreachable still
    /// gets a (fully empty, fully erroring) entry rather than being dropped.
    pub async fn discover_all(&self) -> DiscoverySummary {
        let servers = self.configs.list().await;
        let mut summary = DiscoverySummary::default();
        let mut tasks: FuturesUnordered<_> = servers
            .into_iter()
            .map(|config| async move {
                let name = config.name.clone();
                let snapshot = self.discover_one(&name).await;
                (name, snapshot)
            })
            .collect();

        while let Some((name, snapshot)) = tasks.next().await {
            summary.servers.insert(name, snapshot);
        }
        summary
    }

    async fn discover_one(&self, server: &str) -> ServerCapabilitySnapshot {
        let mut snapshot = ServerCapabilitySnapshot::default();

        match self.dispatcher.list_tools(server).await {
            Ok(result) => snapshot.tools = result.tools,
            Err(err) => {
                snapshot.errors_if_any.insert("tools".to_string(), err.to_string());
            }
        }
        match self.dispatcher.list_resources(server).await {
            Ok(result) => snapshot.resources = result.resources,
            Err(err) => {
                snapshot.errors_if_any.insert("resources".to_string(), err.to_string());
            }
        }
        match self.dispatcher.list_resource_templates(server).await {
            Ok(result) => snapshot.resource_templates = result.resource_templates,
            Err(err) => {
                snapshot.errors_if_any.insert("resource_templates".to_string(), err.to_string());
            }
        }
        match self.dispatcher.list_prompts(server).await {
            Ok(result) => snapshot.prompts = result.prompts,
            Err(err) => {
                snapshot.errors_if_any.insert("prompts".to_string(), err.to_string());
            }
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_info() -> ClientInfo {
        ClientInfo {
            name: "multiplexer".into(),
            version: "0.1.0".into(),
        }
    }

    #[tokio::test]
    async fn discover_all_with_no_servers_returns_empty_summary() {
        let manager = ClientManager::new(client_info(), ClientCapabilities::default());
        let summary = manager.discover_all().await;
        assert!(summary.servers.is_empty());
    }

    #[tokio::test]
    async fn discover_all_never_short_circuits_and_records_per_category_errors() {
        use crate::config::TransportKind;
        use std::collections::HashMap as Map;

        let manager = ClientManager::new(client_info(), ClientCapabilities::default());
        manager
            .register_server(MCPServerConfig::new(
                "srv-1",
                "broken",
                TransportKind::Stdio {
                    command: "definitely-not-a-real-binary-xyz".into(),
                    args: vec![],
                    env: Map::new(),
                },
            ))
            .await;

        let summary = manager.discover_all().await;
        let snapshot = summary.servers.get("broken").expect("unreachable server still reports a snapshot");
        assert!(snapshot.tools.is_empty());
        assert!(snapshot.resources.is_empty());
        assert!(snapshot.resource_templates.is_empty());
        assert!(snapshot.prompts.is_empty());
        for category in ["tools", "resources", "resource_templates", "prompts"] {
            assert!(snapshot.errors_if_any.contains_key(category), "missing error for {category}");
        }
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent_and_count_sessions() {
        let manager = ClientManager::new(client_info(), ClientCapabilities::default());
        manager.start();
        manager.start();
        assert_eq!(manager.stop().await, 0);
    }
}
