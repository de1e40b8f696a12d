//! Streamable-HTTP transport: one POST per outbound request or notification,
//! with the response being either a single JSON object or a chunked stream
//! of `data:`-framed JSON-RPC messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::protocol::message::{JsonRpcMessage, JsonRpcMessageTrait};
use crate::protocol::transport::{extract_response_info, MessageContext, MessageHandler, Transport, TransportError};

const SESSION_HEADER: &str = "mcp-session-id";

/// `session_id` is only ever touched from `&mut self` methods (`send`,
/// `set_session_context`) plus a `&self` getter the `Mutex<Box<dyn
/// Transport>>` wrapper one layer up already serializes against every other
/// call — no interior mutability needed here.
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Option<String>,
    handler: Arc<dyn MessageHandler<()>>,
    connected: AtomicBool,
}

impl HttpTransport {
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
            handler,
            connected: AtomicBool::new(false),
        })
    }

    fn capture_session_header(&mut self, headers: &HeaderMap) {
        if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            self.session_id = Some(value.to_string());
        }
    }

    async fn dispatch_incoming(&self, body: &str) {
        for line in body.lines() {
            let payload = line.strip_prefix("data:").map(str::trim).unwrap_or_else(|| line.trim());
            if payload.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcMessage>(payload) {
                Ok(message) => self.handler.handle_message(message, MessageContext::without_session()).await,
                Err(err) => self.handler.handle_error(TransportError::from(err)).await,
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
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
        let body = message.to_json()?;
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream")
            .body(body);

        if let Some(session_id) = self.session_id.clone() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await.map_err(|err| TransportError::Connection { message: err.to_string() })?;
        let status = response.status();
        self.capture_session_header(response.headers());

        let body_text = response.text().await.ok();
        if !status.is_success() {
            let (status, body) = extract_response_info(status.as_u16(), body_text.map(Ok));
            return Err(TransportError::Http { status, body });
        }

        if let Some(body) = body_text {
            if !body.trim().is_empty() {
                self.dispatch_incoming(&body).await;
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
        "http"
    }
}
