//! Multiplexes one downstream MCP client session across many independently
//! managed upstream MCP server sessions.
//!
//! # Architecture
//!
//! - **Protocol layer** (`protocol`): JSON-RPC 2.0 wire types, MCP domain
//!   types, and the transport abstraction they ride on.
//! - **Configuration layer** (`config`): what a server is, how to reach it,
//!   and its last-observed connection status.
//! - **Transport layer** (`transport`): concrete stdio/SSE/streamable-HTTP
//!   transports and the factory that picks one from a server's configuration.
//! - **Session layer** (`session`): request/response correlation and the
//!   nine operations an initialised upstream session exposes.
//! - **Lifecycle layer** (`worker`): the detached task owning one
//!   connection's acquire/release sequence.
//! - **Registry layer** (`registry`): the single-writer map from server
//!   identity to live worker, and the two-phase connect protocol.
//! - **Notification layer** (`router`, `downstream`): fan-in of every
//!   upstream server's notifications to the one downstream session.
//! - **Auth layer** (`auth`): the reactive OAuth branch a 401 triggers.
//! - **Dispatch layer** (`dispatcher`): the retry/error-classification
//!   decorator every operation runs through.
//! - **Manager** (`manager`): the public [`ClientManager`] wiring everything
//!   above together.
//!
//! # Quick start
//!
//! ```rust
//! use mcp_upstream_mux::{ClientManager, MCPServerConfig, TransportKind};
//! use mcp_upstream_mux::protocol::{ClientCapabilities, ClientInfo};
//! use std::collections::HashMap;
//!
//! # tokio_test::block_on(async {
//! let manager = ClientManager::new(
//!     ClientInfo { name: "my-agent".into(), version: "1.0.0".into() },
//!     ClientCapabilities::default(),
//! );
//!
//! manager.register_server(MCPServerConfig::new(
//!     "everything",
//!     "everything",
//!     TransportKind::Stdio {
//!         command: "npx".into(),
//!         args: vec!["@modelcontextprotocol/server-everything".into()],
//!         env: HashMap::new(),
//!     },
//! )).await;
//!
//! assert_eq!(manager.list_servers().await.len(), 1);
//! # });
//! ```

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod downstream;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;
pub mod worker;

pub use auth::{AuthManager, OAuthFlowResult, RedirectAuthManager};
pub use config::{AuthConfig, ConfigStore, ConnectionStatus, InMemoryConfigStore, MCPServerConfig, TransportKind};
pub use downstream::DownstreamSession;
pub use error::ManagerError;
pub use manager::{ClientManager, DiscoverySummary, ServerCapabilitySnapshot};
pub use session::{make_progress_token, ProgressCallback};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::protocol::{ClientCapabilities, ClientInfo};
    use std::collections::HashMap;

    #[tokio::test]
    async fn registering_and_listing_servers_round_trips() {
        let manager = ClientManager::new(
            ClientInfo {
                name: "test-agent".into(),
                version: "0.0.0".into(),
            },
            ClientCapabilities::default(),
        );

        manager
            .register_server(MCPServerConfig::new(
                "srv-1",
                "everything",
                TransportKind::Stdio {
                    command: "npx".into(),
                    args: vec!["@modelcontextprotocol/server-everything".into()],
                    env: HashMap::new(),
                },
            ))
            .await;

        let servers = manager.list_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "everything");
        assert!(manager.connection_status("srv-1").await.is_none());
    }

    #[tokio::test]
    async fn operations_against_an_unregistered_server_fail_fast() {
        let manager = ClientManager::new(
            ClientInfo {
                name: "test-agent".into(),
                version: "0.0.0".into(),
            },
            ClientCapabilities::default(),
        );

        let err = manager.send_ping("ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::ConfigNotFound(_)));
    }

    #[test]
    fn version_is_non_empty() {
        assert!(!version().is_empty());
    }
}
