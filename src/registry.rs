//! Session registry: the single-writer map from server identity to live
//! worker, plus the two-phase connect protocol every `connect_server` call
//! goes through.
//!
//! Grounded on the teacher's correlation-manager shape — a `DashMap` keyed
//! by identity, background work tracked independently of the map, and a
//! bounded wait for readiness — generalised from "one pending request" to
//! "one pending upstream connection."

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{FutureExt, Shared};
use tracing::{info, warn};

use crate::config::{ConfigStore, ConnectionStatus, MCPServerConfig};
use crate::downstream::DownstreamSession;
use crate::error::ManagerError;
use crate::protocol::types::{ClientCapabilities, ClientInfo, ServerCapabilities};
use crate::router::NotificationRouter;
use crate::session::JsonRpcSession;
use crate::worker::{self, WorkerHandle, CONNECT_TIMEOUT};

/// Bound on how long `disconnect_server` waits for a single worker's
/// resource stack to unwind before giving up on it.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregate bound on `stop` across every live worker at once, not a
/// per-worker allowance — workers unwind concurrently, so the wall-clock
/// cost of stopping ten servers is the same as stopping one.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

type ConnectFuture = Shared<Pin<Box<dyn Future<Output = Result<Arc<JsonRpcSession>, Arc<ManagerError>>> + Send>>>;

enum RegistryEntry {
    /// A connect is in flight. The shared future is driven to completion
    /// exactly once no matter how many callers clone and await it — the
    /// mechanism that lets a second concurrent caller for the same server
    /// join the first one's readiness instead of racing its own worker into
    /// existence.
    Connecting(ConnectFuture),
    Connected {
        session: Arc<JsonRpcSession>,
        worker: WorkerHandle,
        server_capabilities: ServerCapabilities,
    },
}

pub struct SessionRegistry {
    self_ref: Weak<SessionRegistry>,
    configs: Arc<dyn ConfigStore>,
    sessions: DashMap<String, RegistryEntry>,
    router: Arc<NotificationRouter>,
    client_info: ClientInfo,
    client_capabilities: ClientCapabilities,
    started: AtomicBool,
}

impl SessionRegistry {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        router: Arc<NotificationRouter>,
        client_info: ClientInfo,
        client_capabilities: ClientCapabilities,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            configs,
            sessions: DashMap::new(),
            router,
            client_info,
            client_capabilities,
            started: AtomicBool::new(false),
        })
    }

    /// Idempotent start gate. A second call while already started is a
    /// no-op, logged rather than treated as an error.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("registry already started, ignoring redundant start");
        }
    }

    pub async fn set_downstream_session(&self, session: Option<Arc<dyn DownstreamSession>>) {
        self.router.set_downstream(session).await;
    }

    /// An existing, already-connected session for `id_or_name`, if any.
    /// Does not start a connection — callers needing one should use
    /// [`Self::connect_server`].
    pub fn existing_session(&self, server_id: &str) -> Option<Arc<JsonRpcSession>> {
        match self.sessions.get(server_id)?.value() {
            RegistryEntry::Connected { session, .. } => Some(session.clone()),
            RegistryEntry::Connecting(_) => None,
        }
    }

    pub fn server_capabilities(&self, server_id: &str) -> Option<ServerCapabilities> {
        match self.sessions.get(server_id)?.value() {
            RegistryEntry::Connected { server_capabilities, .. } => Some(server_capabilities.clone()),
            RegistryEntry::Connecting(_) => None,
        }
    }

    /// Resolve `id_or_name` to a configuration, reusing an existing
    /// connected session if one exists, joining an in-flight connect for the
    /// same server if one is already under way, or establishing a new one
    /// otherwise.
    ///
    /// Two-phase: the reservation (a shared "connecting" future) is inserted
    /// and observed under the `DashMap`'s own per-shard lock; the worker's
    /// readiness is awaited with no lock held; the final state — a real
    /// session, or the reservation rolled back — is committed under the
    /// lock again.
    pub async fn connect_server(&self, id_or_name: &str) -> Result<Arc<JsonRpcSession>, ManagerError> {
        let config = self
            .configs
            .resolve(id_or_name)
            .await
            .ok_or_else(|| ManagerError::ConfigNotFound(id_or_name.to_string()))?;

        let shared = match self.sessions.entry(config.server_id.clone()) {
            Entry::Occupied(occupied) => match occupied.get() {
                RegistryEntry::Connected { session, .. } => return Ok(session.clone()),
                RegistryEntry::Connecting(shared) => shared.clone(),
            },
            Entry::Vacant(vacant) => {
                let registry = match self.self_ref.upgrade() {
                    Some(registry) => registry,
                    None => {
                        return Err(ManagerError::OperationError {
                            server: config.name.clone(),
                            message: "registry was dropped mid-connect".to_string(),
                            source: None,
                        })
                    }
                };
                let fut: Pin<Box<dyn Future<Output = Result<Arc<JsonRpcSession>, Arc<ManagerError>>> + Send>> =
                    Box::pin(async move { registry.drive_connect(config).await });
                let shared = fut.shared();
                vacant.insert(RegistryEntry::Connecting(shared.clone()));
                shared
            }
        };

        shared.await.map_err(|err| err.shared_clone())
    }

    /// Drives one connect attempt to completion and commits its outcome into
    /// `sessions`. Only ever polled by the `Shared` future wrapping it, so
    /// this body runs exactly once per reservation regardless of how many
    /// callers are awaiting the clone.
    async fn drive_connect(self: Arc<Self>, config: MCPServerConfig) -> Result<Arc<JsonRpcSession>, Arc<ManagerError>> {
        self.configs.set_status(&config.server_id, ConnectionStatus::Connecting).await;

        let (ready_rx, worker_handle) = worker::spawn(
            config.clone(),
            self.client_info.clone(),
            self.client_capabilities.clone(),
            self.router.clone(),
        );

        match tokio::time::timeout(CONNECT_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(ready))) => {
                self.sessions.insert(
                    config.server_id.clone(),
                    RegistryEntry::Connected {
                        session: ready.session.clone(),
                        worker: worker_handle,
                        server_capabilities: ready.server_capabilities,
                    },
                );
                self.configs.set_status(&config.server_id, ConnectionStatus::Connected).await;
                info!(server = %config.name, "connected");
                Ok(ready.session)
            }
            Ok(Ok(Err(err))) => {
                self.sessions.remove(&config.server_id);
                self.configs
                    .set_status(&config.server_id, ConnectionStatus::Failed { reason: err.to_string() })
                    .await;
                Err(Arc::new(err))
            }
            Ok(Err(_sender_dropped)) => {
                self.sessions.remove(&config.server_id);
                let message = "worker exited before reporting readiness".to_string();
                self.configs
                    .set_status(&config.server_id, ConnectionStatus::Failed { reason: message.clone() })
                    .await;
                Err(Arc::new(ManagerError::OperationError {
                    server: config.name.clone(),
                    message,
                    source: None,
                }))
            }
            Err(_elapsed) => {
                // Roll back the reservation immediately; the worker may
                // still be mid-handshake, so its unwind runs in the
                // background rather than extending this call's own timeout.
                self.sessions.remove(&config.server_id);
                self.configs
                    .set_status(&config.server_id, ConnectionStatus::Failed { reason: "connect timeout".to_string() })
                    .await;
                tokio::spawn(async move {
                    worker_handle.shutdown_and_join(DISCONNECT_TIMEOUT).await;
                });
                Err(Arc::new(ManagerError::ConnectionTimeout { server: config.name }))
            }
        }
    }

    pub async fn disconnect_server(&self, id_or_name: &str) -> Result<(), ManagerError> {
        let config = self
            .configs
            .resolve(id_or_name)
            .await
            .ok_or_else(|| ManagerError::ConfigNotFound(id_or_name.to_string()))?;

        if let Some((_, entry)) = self.sessions.remove(&config.server_id) {
            if let RegistryEntry::Connected { worker, .. } = entry {
                worker.shutdown_and_join(DISCONNECT_TIMEOUT).await;
            }
        } else {
            warn!(server = %config.name, "disconnect requested for a server with no live session");
        }
        self.configs.set_status(&config.server_id, ConnectionStatus::Disconnected).await;
        Ok(())
    }

    /// Tear down every live upstream session. Returns the number of sessions
    /// that were live (connected or still connecting) at the moment `stop`
    /// was called. Every worker's unwind runs concurrently, bounded by one
    /// aggregate [`STOP_TIMEOUT`] rather than a per-worker allowance.
    pub async fn stop(&self) -> usize {
        let server_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let entries: Vec<(String, RegistryEntry)> = server_ids
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, entry)| (id, entry)))
            .collect();

        let live_count = entries.len();
        let mut server_ids = Vec::with_capacity(entries.len());
        let mut workers = Vec::new();
        for (server_id, entry) in entries {
            if let RegistryEntry::Connected { worker, .. } = entry {
                workers.push(worker);
            }
            server_ids.push(server_id);
        }

        let shutdown_all = futures::future::join_all(workers.into_iter().map(WorkerHandle::shutdown_and_wait));
        if tokio::time::timeout(STOP_TIMEOUT, shutdown_all).await.is_err() {
            warn!("not every upstream worker unwound within the aggregate stop timeout");
        }

        for server_id in server_ids {
            self.configs.set_status(&server_id, ConnectionStatus::Disconnected).await;
        }
        self.started.store(false, Ordering::SeqCst);
        live_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InMemoryConfigStore, MCPServerConfig, TransportKind};
    use std::collections::HashMap;

    fn registry() -> (Arc<SessionRegistry>, Arc<InMemoryConfigStore>) {
        let configs = InMemoryConfigStore::new();
        let router = NotificationRouter::new();
        let registry = SessionRegistry::new(
            configs.clone(),
            router,
            ClientInfo {
                name: "test-manager".into(),
                version: "0.0.0".into(),
            },
            ClientCapabilities::default(),
        );
        (registry, configs)
    }

    #[tokio::test]
    async fn connect_unknown_server_is_config_not_found() {
        let (registry, _configs) = registry();
        let err = registry.connect_server("does-not-exist").await.unwrap_err();
        assert!(matches!(err, ManagerError::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn connect_with_unspawnable_command_fails_without_leaving_a_reservation() {
        let (registry, configs) = registry();
        configs
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

        let err = registry.connect_server("broken").await.unwrap_err();
        assert!(matches!(err, ManagerError::OperationError { .. }));
        assert!(registry.existing_session("srv-1").is_none());

        // A retry should attempt a fresh connect rather than reporting
        // "connection already in progress" against a stale reservation.
        let retry_err = registry.connect_server("broken").await.unwrap_err();
        assert!(matches!(retry_err, ManagerError::OperationError { .. }));
    }

    #[tokio::test]
    async fn concurrent_connects_for_the_same_server_join_the_same_outcome() {
        let (registry, configs) = registry();
        configs
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

        let first = registry.connect_server("broken");
        let second = registry.connect_server("broken");
        let (first_result, second_result) = tokio::join!(first, second);

        // Both callers observe the same failure rather than the second one
        // being told a connection is already in progress.
        assert!(matches!(first_result.unwrap_err(), ManagerError::OperationError { .. }));
        assert!(matches!(second_result.unwrap_err(), ManagerError::OperationError { .. }));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (registry, _configs) = registry();
        registry.start();
        registry.start();
    }

    #[tokio::test]
    async fn stop_with_no_live_sessions_returns_zero() {
        let (registry, _configs) = registry();
        assert_eq!(registry.stop().await, 0);
    }
}
