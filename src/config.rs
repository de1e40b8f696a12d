//! Persisted-configuration layer: what an upstream server is, how to reach
//! it, and the connection status last observed for it.
//!
//! Grounded on the single-writer `DashMap` bookkeeping style used by the
//! correlation manager this crate's session registry is itself grounded on
//! (see [`crate::registry`]); the store here is the same shape one layer up,
//! holding server definitions rather than in-flight request state.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use url::Url;

/// How to reach an upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// Spawn a subprocess and speak newline-delimited JSON-RPC over its
    /// stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Server-sent events: a long-lived GET for inbound traffic, POST for
    /// outbound requests.
    Sse {
        url: Url,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Streamable HTTP: POST per request, with the response either a single
    /// JSON object or a chunked SSE-framed stream.
    Http {
        url: Url,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Stdio { .. } => "stdio",
            TransportKind::Sse { .. } => "sse",
            TransportKind::Http { .. } => "http",
        }
    }

    /// Where this server lives, for contexts that want a single descriptive
    /// string regardless of transport kind (the reactive OAuth flow's
    /// `server_url`, logging). Stdio has no network endpoint, so this
    /// describes the command instead.
    pub fn endpoint(&self) -> String {
        match self {
            TransportKind::Stdio { command, .. } => format!("stdio:{command}"),
            TransportKind::Sse { url, .. } => url.to_string(),
            TransportKind::Http { url, .. } => url.to_string(),
        }
    }
}

/// OAuth client configuration used by the reactive 401 flow. Token caching
/// and refresh live in [`crate::auth`]; this is only the static client
/// registration needed to start a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: Option<Url>,
    pub authorize_url: Option<Url>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// A previously obtained bearer token, sent as `Authorization: Bearer
    /// <token>` on every outbound HTTP-family request once present. Reactive
    /// OAuth only ever populates `authorize_url` for the caller to visit;
    /// nothing in this crate writes to this field itself.
    pub access_token: Option<String>,
}

/// Last-observed connection state for a configured server. Distinct from
/// whether a [`crate::registry::SessionRegistry`] entry currently exists for
/// it — a server can be `Disconnected` with no live worker, or `Failed` with
/// no live worker either, after the worker's resource stack unwound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed {
        reason: String,
    },
}

/// A configured upstream server: identity, transport, and optional auth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MCPServerConfig {
    /// Stable identifier, independent of the human-assigned `name`.
    pub server_id: String,
    /// Display name; also accepted wherever a `server_id` is, per the
    /// name-or-id resolution every operation performs before dispatch.
    pub name: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Whether a session is kept open after an operation completes. When
    /// `false`, the dispatcher closes the session immediately after each
    /// inner-wrapper invocation succeeds or fails.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// The `mcp-session-id` the upstream server handed back during its last
    /// handshake, if any. Cleared (and persisted as cleared) by the
    /// dispatcher's stale-session recovery path so the next connect attempt
    /// starts a fresh session rather than replaying a rejected one.
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_keep_alive() -> bool {
    true
}

impl MCPServerConfig {
    pub fn new(server_id: impl Into<String>, name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            server_id: server_id.into(),
            name: name.into(),
            transport,
            auth: None,
            keep_alive: true,
            session_id: None,
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Persisted store of server configurations plus their last-known connection
/// status. A production deployment could back this with a database; the
/// only implementation shipped here is the in-memory one, matching how far
/// the teacher's own in-process stores go before handing off to a real
/// backend.
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    /// Resolve either a `server_id` or a display `name` to its configuration.
    async fn resolve(&self, id_or_name: &str) -> Option<MCPServerConfig>;
    async fn put(&self, config: MCPServerConfig);
    async fn remove(&self, server_id: &str);
    async fn list(&self) -> Vec<MCPServerConfig>;
    async fn set_status(&self, server_id: &str, status: ConnectionStatus);
    async fn status(&self, server_id: &str) -> Option<ConnectionStatus>;
}

/// `DashMap`-backed [`ConfigStore`]. A secondary `name -> server_id` index is
/// maintained so name-or-id resolution never scans the full table.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    by_id: DashMap<String, MCPServerConfig>,
    name_to_id: DashMap<String, String>,
    status: DashMap<String, ConnectionStatus>,
}

impl InMemoryConfigStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn resolve(&self, id_or_name: &str) -> Option<MCPServerConfig> {
        if let Some(cfg) = self.by_id.get(id_or_name) {
            return Some(cfg.clone());
        }
        let id = self.name_to_id.get(id_or_name)?.clone();
        self.by_id.get(&id).map(|entry| entry.clone())
    }

    async fn put(&self, config: MCPServerConfig) {
        self.name_to_id.insert(config.name.clone(), config.server_id.clone());
        self.by_id.insert(config.server_id.clone(), config);
    }

    async fn remove(&self, server_id: &str) {
        if let Some((_, cfg)) = self.by_id.remove(server_id) {
            self.name_to_id.remove(&cfg.name);
        }
        self.status.remove(server_id);
    }

    async fn list(&self) -> Vec<MCPServerConfig> {
        self.by_id.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn set_status(&self, server_id: &str, status: ConnectionStatus) {
        self.status.insert(server_id.to_string(), status);
    }

    async fn status(&self, server_id: &str) -> Option<ConnectionStatus> {
        self.status.get(server_id).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MCPServerConfig {
        MCPServerConfig::new(
            "srv-1",
            "everything",
            TransportKind::Stdio {
                command: "npx".into(),
                args: vec!["@modelcontextprotocol/server-everything".into()],
                env: HashMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn resolves_by_id_or_name() {
        let store = InMemoryConfigStore::new();
        store.put(sample()).await;
        assert!(store.resolve("srv-1").await.is_some());
        assert!(store.resolve("everything").await.is_some());
        assert!(store.resolve("missing").await.is_none());
    }

    #[tokio::test]
    async fn removing_clears_name_index_and_status() {
        let store = InMemoryConfigStore::new();
        store.put(sample()).await;
        store.set_status("srv-1", ConnectionStatus::Connected).await;
        store.remove("srv-1").await;
        assert!(store.resolve("everything").await.is_none());
        assert!(store.status("srv-1").await.is_none());
    }
}
