//! One upstream MCP session's request/response correlation and operation
//! surface.
//!
//! Grounded on the request-correlation half of the teacher's correlation
//! manager (pending map keyed by request id, completed by a background
//! receive loop via a handler) paired down to a single session rather than
//! a registry of them — the registry-of-sessions piece lives one layer up,
//! in [`crate::registry`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ManagerError;
use crate::protocol::errors::JsonRpcError;
use crate::protocol::message::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId};
use crate::protocol::transport::{MessageContext, MessageHandler, Transport, TransportError};
use crate::protocol::types::{
    CallToolResult, ClientCapabilities, ClientInfo, GetPromptResult, InitializeRequest, InitializeResponse,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, ProtocolVersion,
    ReadResourceResult,
};
use crate::router::{token_to_string, NotificationRouter};

/// Called with `(progress, total, message)` each time a matching
/// `notifications/progress` arrives for a token this session registered.
pub type ProgressCallback = Arc<dyn Fn(f64, Option<f64>, Option<String>) + Send + Sync>;

/// Deadline for a single request/response round trip. Connect timeouts are
/// a separate, longer-lived concern owned by the lifecycle worker.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<DashMap<RequestId, oneshot::Sender<Result<Value, JsonRpcError>>>>;
type ProgressMap = Arc<DashMap<String, ProgressCallback>>;

/// Build the progress token handed to an upstream server on a `tools/call`
/// that registered a progress callback.
pub fn make_progress_token(server_name: &str, tool_name: &str) -> String {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{server_name}_{tool_name}_{suffix}")
}

/// Owns one upstream server's transport and the request/response correlation
/// over it. Constructed as a pair with its [`SessionMessageHandler`]; the
/// handler is what the transport's background receive loop actually calls
/// into, sharing the same pending/progress maps by `Arc`.
pub struct JsonRpcSession {
    server_name: String,
    transport: Mutex<Box<dyn Transport<Error = TransportError> + Send>>,
    pending: PendingMap,
    progress_callbacks: ProgressMap,
    next_id: AtomicI64,
}

impl std::fmt::Debug for JsonRpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcSession")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl JsonRpcSession {
    /// Wrap a transport that was already constructed with `handler` wired
    /// into it (the transport factory does the wiring, since a concrete
    /// transport needs its handler at construction time, before any session
    /// can exist to hand it one). The session and the handler end up sharing
    /// the same pending/progress maps.
    pub fn new(transport: Box<dyn Transport<Error = TransportError> + Send>, handler: &SessionMessageHandler) -> Arc<Self> {
        Arc::new(Self {
            server_name: handler.server_name.clone(),
            transport: Mutex::new(transport),
            pending: handler.pending.clone(),
            progress_callbacks: handler.progress_callbacks.clone(),
            next_id: AtomicI64::new(1),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Start the underlying transport. For stream-based transports (SSE)
    /// this is where the inbound listener actually begins; for others it's
    /// a formality that keeps every transport's acquisition step uniform.
    pub async fn start(&self) -> Result<(), ManagerError> {
        self.transport
            .lock()
            .await
            .start()
            .await
            .map_err(|err| ManagerError::from_transport(&self.server_name, err))
    }

    pub async fn close(&self) -> Result<(), ManagerError> {
        self.transport
            .lock()
            .await
            .close()
            .await
            .map_err(|err| ManagerError::from_transport(&self.server_name, err))
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::new_number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ManagerError> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let message = JsonRpcMessage::Request(JsonRpcRequest::new(method, params, id.clone()));
        if let Err(err) = self.transport.lock().await.send(&message).await {
            self.pending.remove(&id);
            return Err(ManagerError::from_transport(&self.server_name, err));
        }

        match timeout(OPERATION_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rpc_error))) => Err(ManagerError::from_json_rpc(&self.server_name, rpc_error)),
            Ok(Err(_recv_dropped)) => Err(ManagerError::OperationCancelled {
                server: self.server_name.clone(),
            }),
            Err(_elapsed) => {
                self.pending.remove(&id);
                Err(ManagerError::OperationTimedOut {
                    server: self.server_name.clone(),
                })
            }
        }
    }

    fn decode<R: DeserializeOwned>(&self, value: Value) -> Result<R, ManagerError> {
        serde_json::from_value(value).map_err(|err| ManagerError::OperationError {
            server: self.server_name.clone(),
            message: err.to_string(),
            source: None,
        })
    }

    pub async fn initialize(
        &self,
        client_info: ClientInfo,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResponse, ManagerError> {
        let params = serde_json::to_value(InitializeRequest {
            protocol_version: ProtocolVersion::current(),
            capabilities,
            client_info,
        })
        .map_err(|err| ManagerError::OperationError {
            server: self.server_name.clone(),
            message: err.to_string(),
            source: None,
        })?;
        let value = self.request("initialize", Some(params)).await?;
        self.decode(value)
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, ManagerError> {
        let value = self.request("tools/list", None).await?;
        self.decode(value)
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, ManagerError> {
        let value = self.request("prompts/list", None).await?;
        self.decode(value)
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult, ManagerError> {
        let value = self.request("resources/list", None).await?;
        self.decode(value)
    }

    pub async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult, ManagerError> {
        let value = self.request("resources/templates/list", None).await?;
        self.decode(value)
    }

    /// `progress` registers a callback keyed by a freshly minted token; it is
    /// deregistered once the call completes, win or lose, so a stray late
    /// `notifications/progress` for a finished call falls through to the
    /// notification router instead of calling a callback for a call that's
    /// already returned.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        progress: Option<(String, ProgressCallback)>,
    ) -> Result<CallToolResult, ManagerError> {
        let mut params = serde_json::json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| serde_json::json!({})),
        });
        if let Some((token, callback)) = &progress {
            params["_meta"] = serde_json::json!({ "progressToken": token });
            self.progress_callbacks.insert(token.clone(), callback.clone());
        }

        let result = self.request("tools/call", Some(params)).await;
        if let Some((token, _)) = &progress {
            self.progress_callbacks.remove(token);
        }
        self.decode(result?)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ManagerError> {
        let value = self.request("resources/read", Some(serde_json::json!({ "uri": uri }))).await?;
        self.decode(value)
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult, ManagerError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let value = self.request("prompts/get", Some(params)).await?;
        self.decode(value)
    }

    /// Upstream servers expect `ping` to round-trip with no body.
    pub async fn send_ping(&self) -> Result<(), ManagerError> {
        self.request("ping", None).await?;
        Ok(())
    }
}

/// Implements the receive side of a session: completes pending requests,
/// routes notifications (diverting caller-matched progress notifications
/// away from the router), and fails every pending request when the
/// transport closes.
pub struct SessionMessageHandler {
    server_name: String,
    pending: PendingMap,
    progress_callbacks: ProgressMap,
    router: Arc<NotificationRouter>,
}

impl SessionMessageHandler {
    pub fn new(server_name: impl Into<String>, router: Arc<NotificationRouter>) -> Arc<Self> {
        Arc::new(Self {
            server_name: server_name.into(),
            pending: Arc::new(DashMap::new()),
            progress_callbacks: Arc::new(DashMap::new()),
            router,
        })
    }
}

#[async_trait]
impl MessageHandler<()> for SessionMessageHandler {
    async fn handle_message(&self, message: JsonRpcMessage, _context: MessageContext<()>) {
        match message {
            JsonRpcMessage::Response(response) => {
                let Some(id) = response.id else {
                    warn!(server_name = %self.server_name, "response with no id, dropping");
                    return;
                };
                let Some((_, sender)) = self.pending.remove(&id) else {
                    debug!(server_name = %self.server_name, %id, "response for unknown or already-completed request");
                    return;
                };
                let outcome = match response.error {
                    Some(error_value) => Err(decode_json_rpc_error(error_value)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = sender.send(outcome);
            }
            JsonRpcMessage::Notification(notification) => self.dispatch_notification(notification).await,
            JsonRpcMessage::Request(request) => {
                debug!(server_name = %self.server_name, method = %request.method, "ignoring server-initiated request");
            }
        }
    }

    async fn handle_error(&self, error: TransportError) {
        warn!(server_name = %self.server_name, %error, "transport error");
    }

    async fn handle_close(&self) {
        info!(server_name = %self.server_name, "transport closed, failing outstanding requests");
        let ids: Vec<RequestId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, sender)) = self.pending.remove(&id) {
                let _ = sender.send(Err(JsonRpcError {
                    code: JsonRpcError::INTERNAL_ERROR,
                    message: "transport closed".to_string(),
                    data: None,
                }));
            }
        }
    }
}

impl SessionMessageHandler {
    async fn dispatch_notification(&self, notification: JsonRpcNotification) {
        if notification.method == "notifications/progress" {
            if let Some(params) = &notification.params {
                let token = params.get("progressToken").and_then(token_to_string);
                if let Some(callback) = token.as_deref().and_then(|t| self.progress_callbacks.get(t)) {
                    let progress = params.get("progress").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let total = params.get("total").and_then(|v| v.as_f64());
                    let message = params.get("message").and_then(|v| v.as_str()).map(str::to_string);
                    callback(progress, total, message);
                    return;
                }
            }
        }
        self.router.route(&self.server_name, notification).await;
    }
}

fn decode_json_rpc_error(value: Value) -> JsonRpcError {
    serde_json::from_value(value).unwrap_or(JsonRpcError {
        code: JsonRpcError::INTERNAL_ERROR,
        message: "malformed error object in response".to_string(),
        data: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct MockTransport {
        sent: Arc<Mutex<Vec<JsonRpcMessage>>>,
        connected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        type Error = TransportError;

        async fn start(&mut self) -> Result<(), Self::Error> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), Self::Error> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), Self::Error> {
            self.sent.lock().await.push(message.clone());
            Ok(())
        }

        fn session_id(&self) -> Option<String> {
            None
        }

        fn set_session_context(&mut self, _session_id: Option<String>) {}

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn transport_type(&self) -> &'static str {
            "mock"
        }
    }

    #[tokio::test]
    async fn transport_close_fails_every_pending_request() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Box::new(MockTransport {
            sent: sent.clone(),
            connected: Arc::new(AtomicBool::new(true)),
        });
        let router = NotificationRouter::new();
        let handler = SessionMessageHandler::new("srv-A", router);
        let session = JsonRpcSession::new(transport, &handler);

        let session_for_call = session.clone();
        let call = tokio::spawn(async move { session_for_call.send_ping().await });
        // Give the spawned request time to register itself in `pending`.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        handler.handle_close().await;
        let outcome = call.await.unwrap();
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn progress_notification_with_matching_token_bypasses_router() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Box::new(MockTransport {
            sent,
            connected: Arc::new(AtomicBool::new(true)),
        });
        let router = NotificationRouter::new();
        let handler = SessionMessageHandler::new("srv-A", router);
        let _session = JsonRpcSession::new(transport, &handler);

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let callback: ProgressCallback = Arc::new(move |progress, _total, _message| {
            let seen = seen_clone.clone();
            tokio::spawn(async move {
                *seen.lock().await = Some(progress);
            });
        });
        handler.progress_callbacks.insert("tok-1".to_string(), callback);

        handler
            .handle_message(
                JsonRpcMessage::Notification(JsonRpcNotification::new(
                    "notifications/progress",
                    Some(serde_json::json!({"progressToken": "tok-1", "progress": 0.75})),
                )),
                MessageContext::without_session(),
            )
            .await;

        tokio::task::yield_now().await;
        assert_eq!(*seen.lock().await, Some(0.75));
    }
}
