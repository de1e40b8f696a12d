//! Subprocess transport: one upstream MCP server speaking newline-delimited
//! JSON-RPC over its own stdin/stdout.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::protocol::message::{JsonRpcMessage, JsonRpcMessageTrait};
use crate::protocol::transport::{MessageContext, MessageHandler, Transport, TransportError};

pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    connected: Arc<AtomicBool>,
    session_id: Option<String>,
    reader_task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        handler: Arc<dyn MessageHandler<()>>,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connection {
                message: "child process did not open a stdin pipe".to_string(),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connection {
                message: "child process did not open a stdout pipe".to_string(),
            })?;

        let connected = Arc::new(AtomicBool::new(true));
        let reader_connected = connected.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcMessage>(line) {
                            Ok(message) => handler.handle_message(message, MessageContext::without_session()).await,
                            Err(err) => handler.handle_error(TransportError::from(err)).await,
                        }
                    }
                    Ok(None) => {
                        reader_connected.store(false, Ordering::SeqCst);
                        handler.handle_close().await;
                        break;
                    }
                    Err(err) => {
                        reader_connected.store(false, Ordering::SeqCst);
                        handler.handle_error(TransportError::from(err)).await;
                        handler.handle_close().await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            connected,
            session_id: None,
            reader_task: Some(reader_task),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = TransportError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        // The reader task is already running from `new`; there is nothing
        // further to start. `start` exists so every transport's acquisition
        // step looks the same to the lifecycle worker.
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.child.start_kill().ok();
        Ok(())
    }

    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), Self::Error> {
        let mut line = message.to_json()?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
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
        "stdio"
    }
}
