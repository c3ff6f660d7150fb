//! stdio transport
//!
//! Spawns a child process and exchanges newline-delimited JSON-RPC over its
//! stdin/stdout. Stderr is captured and forwarded to the logger at warn
//! level, never parsed as protocol. Child exit closes the transport, which
//! makes the multiplexer fail every outstanding request.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::resolve_env_var;
use crate::error::{CoreError, Result};
use crate::model::StdioConfig;
use crate::rpc::protocol::JsonRpcMessage;

use super::framing::{forward_chunk, FrameBuffer};
use super::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};

struct StdioInner {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
}

/// Transport over a local child process.
pub struct StdioTransport {
    config: StdioConfig,
    inner: Mutex<Option<StdioInner>>,
    connected: Arc<AtomicBool>,
    last_error: Arc<StdMutex<Option<String>>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(StdMutex::new(None)),
        }
    }

    fn record_error(last_error: &StdMutex<Option<String>>, message: String) {
        *last_error.lock().expect("last_error poisoned") = Some(message);
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return Err(CoreError::Connection(
                "stdio transport already connected".to_string(),
            ));
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        for (key, value) in &self.config.env {
            cmd.env(key, resolve_env_var(value)?);
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            CoreError::Connection(format!(
                "failed to spawn '{}': {}",
                self.config.command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Connection("failed to capture child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Connection("failed to capture child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::Connection("failed to capture child stderr".to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let connected = self.connected.clone();
        let last_error = self.last_error.clone();
        let command = self.config.command.clone();
        let reader = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut framer = FrameBuffer::new();
            let mut buf = [0u8; 4096];
            let reason = loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break "child stdout closed (EOF)".to_string(),
                    Ok(n) => {
                        if !forward_chunk(&mut framer, &buf[..n], &events_tx, &command).await {
                            break "event channel dropped".to_string();
                        }
                    }
                    Err(e) => break format!("read from child stdout failed: {}", e),
                }
            };
            debug!(command = %command, reason = %reason, "stdio transport closing");
            connected.store(false, Ordering::SeqCst);
            Self::record_error(&last_error, reason.clone());
            let _ = events_tx.send(TransportEvent::Closed { reason }).await;
        });

        let stderr_command = self.config.command.clone();
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(command = %stderr_command, stderr = %line, "server stderr");
            }
        });

        *slot = Some(StdioInner {
            child,
            stdin,
            reader,
            stderr_reader,
        });
        self.connected.store(true, Ordering::SeqCst);
        Ok(events_rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut slot = self.inner.lock().await;
        if let Some(mut inner) = slot.take() {
            // Dropping stdin sends EOF; most servers exit on it. Kill is the
            // backstop for the ones that do not.
            drop(inner.stdin);
            if let Err(e) = inner.child.kill().await {
                warn!(error = %e, "failed to kill child process");
            }
            let _ = inner.child.wait().await;
            inner.reader.abort();
            inner.stderr_reader.abort();
        }
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let mut slot = self.inner.lock().await;
        let inner = slot
            .as_mut()
            .ok_or_else(|| CoreError::Connection("stdio transport not connected".to_string()))?;

        let json = serde_json::to_string(message)?;
        let write = async {
            inner.stdin.write_all(json.as_bytes()).await?;
            inner.stdin.write_all(b"\n").await?;
            inner.stdin.flush().await
        };
        if let Err(e) = write.await {
            let message = format!("write to child stdin failed: {}", e);
            self.connected.store(false, Ordering::SeqCst);
            Self::record_error(&self.last_error, message.clone());
            return Err(CoreError::Connection(message));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(command: &str, args: &[&str]) -> StdioConfig {
        StdioConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_connection_error() {
        let transport = StdioTransport::new(config("definitely-not-a-command-93514", &[]));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, CoreError::Connection(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_when_not_connected() {
        let transport = StdioTransport::new(config("cat", &[]));
        let message = JsonRpcMessage::Request(crate::rpc::protocol::JsonRpcRequest::new(
            1, "ping", None,
        ));
        let err = transport.send(&message).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_emits_closed() {
        let transport = StdioTransport::new(config("sh", &["-c", "exit 0"]));
        let mut events = transport.connect().await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        match event {
            Some(TransportEvent::Closed { .. }) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(!transport.is_connected());
        transport.disconnect().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_round_trip_over_child_stdio() {
        // cat echoes our request line back; the request parses as a Request
        // frame on the way in.
        let transport = StdioTransport::new(config("cat", &[]));
        let mut events = transport.connect().await.unwrap();
        assert!(transport.is_connected());

        let message = JsonRpcMessage::Request(crate::rpc::protocol::JsonRpcRequest::new(
            7,
            "tools/list",
            None,
        ));
        transport.send(&message).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        match event {
            Some(TransportEvent::Message(JsonRpcMessage::Request(echoed))) => {
                assert_eq!(echoed.id, 7);
                assert_eq!(echoed.method, "tools/list");
            }
            other => panic!("expected echoed request, got {:?}", other),
        }

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }
}
