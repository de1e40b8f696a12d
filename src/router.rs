//! Fan-in point for every upstream server's notifications.
//!
//! One [`NotificationRouter`] is shared by every session in the registry; the
//! per-session piece of state is only the `server_name` passed to
//! [`NotificationRouter::route`]. Progress notifications that correlate to a
//! caller's own in-flight `call_tool` never reach this router — those are
//! intercepted upstream, in the session's message handler, and delivered
//! straight to the caller's progress callback. Only "ambient" progress (no
//! matching local callback) and every other notification kind flow through
//! here to the one downstream session.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::downstream::DownstreamSession;
use crate::protocol::message::JsonRpcNotification;
use crate::protocol::types::LogLevel;

/// Routes classified upstream notifications to the single active downstream
/// session, if one is attached.
pub struct NotificationRouter {
    downstream: RwLock<Option<Arc<dyn DownstreamSession>>>,
}

impl NotificationRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            downstream: RwLock::new(None),
        })
    }

    pub async fn set_downstream(&self, session: Option<Arc<dyn DownstreamSession>>) {
        *self.downstream.write().await = session;
    }

    /// Classify one notification from `server_name` and forward it. Unknown
    /// methods are logged and dropped rather than treated as an error — a
    /// server announcing a notification kind this manager doesn't know about
    /// yet must not break the receive loop for everything else.
    pub async fn route(&self, server_name: &str, notification: JsonRpcNotification) {
        let guard = self.downstream.read().await;
        let Some(downstream) = guard.as_ref() else {
            return;
        };

        match notification.method.as_str() {
            "notifications/tools/list_changed" => {
                info!(server_name, "tool list changed, forwarding");
                downstream.send_tool_list_changed(server_name).await;
            }
            "notifications/resources/list_changed" => {
                info!(server_name, "resource list changed, forwarding");
                downstream.send_resource_list_changed(server_name).await;
            }
            "notifications/prompts/list_changed" => {
                info!(server_name, "prompt list changed, forwarding");
                downstream.send_prompt_list_changed(server_name).await;
            }
            "notifications/resources/updated" => {
                let Some(uri) = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(|v| v.as_str())
                else {
                    warn!(server_name, "resources/updated notification missing uri");
                    return;
                };
                info!(server_name, uri, "resource updated, forwarding");
                downstream.send_resource_updated(server_name, uri).await;
            }
            "notifications/message" => {
                let params = notification.params.unwrap_or(serde_json::Value::Null);
                let level = params
                    .get("level")
                    .and_then(|v| v.as_str())
                    .and_then(parse_log_level)
                    .unwrap_or(LogLevel::Info);
                let logger = params.get("logger").and_then(|v| v.as_str()).map(str::to_string);
                let data = params.get("data").cloned().unwrap_or(serde_json::Value::Null);
                debug!(server_name, logger = logger.as_deref(), "log message, forwarding");
                downstream
                    .send_log_message(server_name, level, logger.as_deref(), &data)
                    .await;
            }
            "notifications/progress" => {
                let Some(params) = notification.params else {
                    return;
                };
                let Some(token) = params.get("progressToken").and_then(token_to_string) else {
                    return;
                };
                let progress = params.get("progress").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let total = params.get("total").and_then(|v| v.as_f64());
                let message = params.get("message").and_then(|v| v.as_str());
                debug!(server_name, token, progress, "ambient progress, forwarding");
                downstream
                    .send_progress_notification(server_name, &token, progress, total, message)
                    .await;
            }
            other => {
                debug!(server_name, method = other, "unrecognised upstream notification, dropping");
            }
        }

        // Yield after every notification so one server's burst of
        // notifications can't starve the other upstream sessions sharing
        // this router from getting their own turns on the executor.
        tokio::task::yield_now().await;
    }
}

pub(crate) fn token_to_string(value: &serde_json::Value) -> Option<String> {
    value.as_str().map(str::to_string).or_else(|| value.as_i64().map(|n| n.to_string()))
}

fn parse_log_level(raw: &str) -> Option<LogLevel> {
    match raw {
        "debug" => Some(LogLevel::Debug),
        "info" | "notice" => Some(LogLevel::Info),
        "warning" | "warn" => Some(LogLevel::Warning),
        "error" => Some(LogLevel::Error),
        "critical" | "alert" | "emergency" => Some(LogLevel::Critical),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::downstream::test_support::RecordingDownstream;

    #[tokio::test]
    async fn routes_list_changed_by_method_name() {
        let router = NotificationRouter::new();
        let downstream = Arc::new(RecordingDownstream::default());
        router.set_downstream(Some(downstream.clone())).await;

        router
            .route("srv-A", JsonRpcNotification::new("notifications/tools/list_changed", None))
            .await;

        assert_eq!(downstream.events.lock().unwrap().as_slice(), ["tool_list_changed:srv-A"]);
    }

    #[tokio::test]
    async fn routes_progress_with_string_token() {
        let router = NotificationRouter::new();
        let downstream = Arc::new(RecordingDownstream::default());
        router.set_downstream(Some(downstream.clone())).await;

        router
            .route(
                "srv-A",
                JsonRpcNotification::new(
                    "notifications/progress",
                    Some(serde_json::json!({"progressToken": "abc", "progress": 0.5})),
                ),
            )
            .await;

        assert_eq!(downstream.events.lock().unwrap().as_slice(), ["progress:srv-A:abc:0.5"]);
    }

    #[tokio::test]
    async fn drops_notification_when_no_downstream_attached() {
        let router = NotificationRouter::new();
        router
            .route("srv-A", JsonRpcNotification::new("notifications/tools/list_changed", None))
            .await;
        // No panic, nothing to assert beyond "it returned".
    }

    #[tokio::test]
    async fn unknown_method_is_dropped_without_panicking() {
        let router = NotificationRouter::new();
        let downstream = Arc::new(RecordingDownstream::default());
        router.set_downstream(Some(downstream.clone())).await;
        router.route("srv-A", JsonRpcNotification::new("notifications/future_thing", None)).await;
        assert!(downstream.events.lock().unwrap().is_empty());
    }
}
