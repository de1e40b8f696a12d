//! The single downstream MCP session this manager serves.
//!
//! Every upstream server's notifications fan in through
//! [`crate::router::NotificationRouter`] and out through one implementation
//! of this trait. There is exactly one active downstream session at a time;
//! [`crate::manager::ClientManager::set_downstream_session`] swaps it.

use async_trait::async_trait;

use crate::protocol::types::LogLevel;

/// Forwarding surface for the one downstream client this manager is
/// multiplexing upstream servers on behalf of.
///
/// Each method corresponds to one MCP server-to-client notification. Errors
/// are swallowed by the router (logged at `warn`) rather than propagated:
/// a downstream that can't keep up must not be allowed to back-pressure or
/// crash an upstream server's receive loop.
#[async_trait]
pub trait DownstreamSession: Send + Sync {
    async fn send_tool_list_changed(&self, server_name: &str);
    async fn send_resource_list_changed(&self, server_name: &str);
    async fn send_prompt_list_changed(&self, server_name: &str);
    async fn send_resource_updated(&self, server_name: &str, uri: &str);
    async fn send_log_message(&self, server_name: &str, level: LogLevel, logger: Option<&str>, data: &serde_json::Value);
    async fn send_progress_notification(
        &self,
        server_name: &str,
        progress_token: &str,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    );
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// Records every call it receives, for assertions in other modules' tests.
    #[derive(Default)]
    pub struct RecordingDownstream {
        pub events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DownstreamSession for RecordingDownstream {
        async fn send_tool_list_changed(&self, server_name: &str) {
            self.events.lock().unwrap().push(format!("tool_list_changed:{server_name}"));
        }

        async fn send_resource_list_changed(&self, server_name: &str) {
            self.events.lock().unwrap().push(format!("resource_list_changed:{server_name}"));
        }

        async fn send_prompt_list_changed(&self, server_name: &str) {
            self.events.lock().unwrap().push(format!("prompt_list_changed:{server_name}"));
        }

        async fn send_resource_updated(&self, server_name: &str, uri: &str) {
            self.events.lock().unwrap().push(format!("resource_updated:{server_name}:{uri}"));
        }

        async fn send_log_message(&self, server_name: &str, level: LogLevel, _logger: Option<&str>, _data: &serde_json::Value) {
            self.events
                .lock()
                .unwrap()
                .push(format!("log:{server_name}:{}", level.as_str()));
        }

        async fn send_progress_notification(
            &self,
            server_name: &str,
            progress_token: &str,
            progress: f64,
            _total: Option<f64>,
            _message: Option<&str>,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("progress:{server_name}:{progress_token}:{progress}"));
        }
    }
}
