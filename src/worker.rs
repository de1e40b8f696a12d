//! Lifecycle worker: the detached task that owns one upstream connection's
//! resource stack from acquisition through teardown.
//!
//! Acquisition proceeds in order — build transport, start it, run the
//! `initialize` handshake — pushing one release step after each success. Any
//! failure unwinds exactly what was acquired, in reverse, before reporting
//! failure on the ready channel. This mirrors a scoped-acquisition stack
//! rather than a single top-level `Drop`, because the failure point can be
//! mid-sequence and only the owning task may unwind it (never a caller
//! racing the same teardown from outside).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::MCPServerConfig;
use crate::error::ManagerError;
use crate::protocol::types::{ClientCapabilities, ClientInfo, ServerCapabilities};
use crate::router::NotificationRouter;
use crate::session::{JsonRpcSession, SessionMessageHandler};
use crate::transport::build as build_transport;

type ReleaseStep = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// What a successful connect hands back to the registry: the session handle
/// callers invoke operations on, and the capabilities the server advertised
/// during the handshake.
pub struct WorkerReady {
    pub session: Arc<JsonRpcSession>,
    pub server_capabilities: ServerCapabilities,
}

/// A running worker's handle, held by the registry. Dropping the shutdown
/// sender (or sending on it) tells the worker task to unwind and exit;
/// `task` can be awaited for that to complete.
pub struct WorkerHandle {
    pub shutdown: oneshot::Sender<()>,
    pub task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the worker's resource stack to unwind.
    /// Gives up (rather than hanging forever) after `timeout`, matching the
    /// same bounded-wait shape as connect's own ready timeout.
    pub async fn shutdown_and_join(self, timeout: Duration) {
        let _ = self.shutdown.send(());
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            warn!("worker did not unwind within shutdown timeout, abandoning it");
        }
    }

    /// Signal shutdown and wait for the unwind to finish, with no per-worker
    /// bound of its own. Used when a caller is already bounding the
    /// aggregate wait across many workers at once (see
    /// [`crate::registry::SessionRegistry::stop`]) rather than imposing a
    /// timeout per worker.
    pub async fn shutdown_and_wait(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Deadline for a connect attempt (transport start through `initialize`
/// returning) before the caller sees [`ManagerError::ConnectionTimeout`].
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn the worker task for `config`. Returns immediately; the caller
/// awaits `ready` (with its own timeout — see [`CONNECT_TIMEOUT`]) to learn
/// whether the connection succeeded.
pub fn spawn(
    config: MCPServerConfig,
    client_info: ClientInfo,
    client_capabilities: ClientCapabilities,
    router: Arc<NotificationRouter>,
) -> (oneshot::Receiver<Result<WorkerReady, ManagerError>>, WorkerHandle) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(run(config, client_info, client_capabilities, router, ready_tx, shutdown_rx));

    (
        ready_rx,
        WorkerHandle {
            shutdown: shutdown_tx,
            task,
        },
    )
}

async fn run(
    config: MCPServerConfig,
    client_info: ClientInfo,
    client_capabilities: ClientCapabilities,
    router: Arc<NotificationRouter>,
    ready_tx: oneshot::Sender<Result<WorkerReady, ManagerError>>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let server_name = config.name.clone();
    let mut release_stack: Vec<ReleaseStep> = Vec::new();

    let handler = SessionMessageHandler::new(server_name.clone(), router);
    let transport = match build_transport(&config, handler.clone()) {
        Ok(transport) => transport,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    let session = JsonRpcSession::new(transport, &handler);
    {
        let session = session.clone();
        release_stack.push(Box::new(move || {
            Box::pin(async move {
                if let Err(err) = session.close().await {
                    warn!(server_name = %session.server_name(), %err, "error closing session during unwind");
                }
            })
        }));
    }

    if let Err(err) = session.start().await {
        unwind(release_stack).await;
        let _ = ready_tx.send(Err(err));
        return;
    }

    match session.initialize(client_info, client_capabilities).await {
        Ok(response) => {
            info!(server_name, protocol_version = %response.protocol_version, "upstream session initialized");
            let ready = WorkerReady {
                session: session.clone(),
                server_capabilities: response.capabilities,
            };
            if ready_tx.send(Ok(ready)).is_err() {
                // Registry gave up waiting (connect timeout already fired on
                // its side); unwind immediately rather than idling.
                unwind(release_stack).await;
                return;
            }
        }
        Err(err) => {
            unwind(release_stack).await;
            let _ = ready_tx.send(Err(err));
            return;
        }
    }

    // Steady state: idle until told to shut down, then unwind.
    let _ = shutdown_rx.await;
    info!(server_name, "worker shutting down");
    unwind(release_stack).await;
}

async fn unwind(stack: Vec<ReleaseStep>) {
    for release in stack.into_iter().rev() {
        release().await;
    }
}
