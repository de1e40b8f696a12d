//! Server-sent-events transport: a long-lived GET carries every inbound
//! message, outbound requests go out over individual POSTs. Pre-dates
//! streamable HTTP in the MCP spec lineage but some upstream servers still
//! only speak this shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::task::JoinHandle;
use url::Url;

use crate::protocol::message::{JsonRpcMessage, JsonRpcMessageTrait};
use crate::protocol::transport::{MessageContext, MessageHandler, Transport, TransportError};

/// `session_id` is only touched from `&mut self` methods; the background
/// stream task reads messages but never needs the session id itself, so no
/// interior mutability is required here either (see `http::HttpTransport`).
pub struct SseTransport {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Option<String>,
    connected: Arc<AtomicBool>,
    stream_task: Option<JoinHandle<()>>,
    handler: Arc<dyn MessageHandler<()>>,
}

impl SseTransport {
    pub fn new(url: Url, headers: HashMap<String, String>, handler: Arc<dyn MessageHandler<()>>) -> Result<Self, TransportError> {
        let mut header_map = HeaderMap::new();
        for (key, value) in &headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|err| TransportError::Protocol {
                message: format!("invalid header name {key}: {err}"),
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| TransportError::Protocol {
                message: format!("invalid header value for {key}: {err}"),
            })?;
            header_map.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| TransportError::Connection { message: err.to_string() })?;
        Ok(Self {
            client,
            url,
            headers: header_map,
            session_id: None,
            connected: Arc::new(AtomicBool::new(false)),
            stream_task: None,
            handler,
        })
    }
}

/// Parse one `event:`/`data:` block out of an SSE byte stream as it arrives.
/// Only the `data:` line matters for MCP's purposes; `event:`/`id:` are
/// accepted but not interpreted.
fn extract_data_lines(buffer: &mut String) -> Vec<String> {
    let mut messages = Vec::new();
    while let Some(boundary) = buffer.find("\n\n") {
        let block: String = buffer.drain(..boundary + 2).collect();
        let mut data = String::new();
        for line in block.lines() {
            if let Some(chunk) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(chunk.trim());
            }
        }
        if !data.is_empty() {
            messages.push(data);
        }
    }
    messages
}

#[async_trait]
impl Transport for SseTransport {
    type Error = TransportError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|err| TransportError::Connection { message: err.to_string() })?;

        if !response.status().is_success() {
            return Err(TransportError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        let handler = self.handler.clone();
        let connected = self.connected.clone();
        let mut byte_stream = response.bytes_stream();

        self.stream_task = Some(tokio::spawn(async move {
            let mut buffer = String::new();
            loop {
                match byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        for payload in extract_data_lines(&mut buffer) {
                            match serde_json::from_str::<JsonRpcMessage>(&payload) {
                                Ok(message) => handler.handle_message(message, MessageContext::without_session()).await,
                                Err(err) => handler.handle_error(TransportError::from(err)).await,
                            }
                        }
                    }
                    Some(Err(err)) => {
                        connected.store(false, Ordering::SeqCst);
                        handler.handle_error(TransportError::Connection { message: err.to_string() }).await;
                        handler.handle_close().await;
                        break;
                    }
                    None => {
                        connected.store(false, Ordering::SeqCst);
                        handler.handle_close().await;
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), Self::Error> {
        let body = message.to_json()?;
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header("content-type", "application/json")
            .body(body);
        if let Some(session_id) = self.session_id.clone() {
            request = request.header("mcp-session-id", session_id);
        }

        let response = request.send().await.map_err(|err| TransportError::Connection { message: err.to_string() })?;
        let status = response.status();
        if let Some(session_id) = response.headers().get("mcp-session-id").and_then(|v| v.to_str().ok()) {
            self.session_id = Some(session_id.to_string());
        }
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        // A 2xx with no body means the actual response arrives later on the
        // GET stream; a 2xx with a body is a direct (non-streamed) reply.
        if let Ok(body) = response.text().await {
            if !body.trim().is_empty() {
                if let Ok(message) = serde_json::from_str::<JsonRpcMessage>(body.trim()) {
                    self.handler.handle_message(message, MessageContext::without_session()).await;
                }
            }
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn set_session_context(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> &'static str {
        "sse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_multiple_data_blocks_from_one_chunk() {
        let mut buffer = String::from("event: message\ndata: {\"a\":1}\n\ndata: {\"a\":2}\n\n");
        let messages = extract_data_lines(&mut buffer);
        assert_eq!(messages, vec!["{\"a\":1}", "{\"a\":2}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn holds_partial_block_until_terminator_arrives() {
        let mut buffer = String::from("data: {\"a\":1}\n");
        let messages = extract_data_lines(&mut buffer);
        assert!(messages.is_empty());
        assert_eq!(buffer, "data: {\"a\":1}\n");
    }
}
