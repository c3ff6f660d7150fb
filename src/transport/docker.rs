//! Docker transport
//!
//! Attaches to an existing named container, or creates and starts an
//! ephemeral one from an image (with an optional command override), and
//! frames newline-delimited JSON-RPC over the container's attach stream.
//! Docker multiplexes stdout and stderr on that stream; the attach API
//! demultiplexes the 8-byte stream-type headers, stdout feeds the framer
//! and stderr goes to the logger. When the attach stream or the container
//! ends the transport closes. Containers the core created are removed on
//! disconnect.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::model::DockerConfig;
use crate::rpc::protocol::JsonRpcMessage;

use super::framing::{forward_chunk, FrameBuffer};
use super::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};

const STOP_GRACE_SECS: i64 = 2;

struct DockerInner {
    docker: Docker,
    container_id: String,
    ephemeral: bool,
    input: Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    reader: JoinHandle<()>,
}

/// Transport over a container's multiplexed attach stream.
pub struct DockerTransport {
    config: DockerConfig,
    inner: Mutex<Option<DockerInner>>,
    connected: Arc<AtomicBool>,
    last_error: Arc<StdMutex<Option<String>>>,
}

impl DockerTransport {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(StdMutex::new(None)),
        }
    }

    /// Resolve the container to attach to, creating an ephemeral one when
    /// only an image is configured. Returns (id, ephemeral).
    async fn resolve_container(&self, docker: &Docker) -> Result<(String, bool)> {
        if let Some(name) = &self.config.container {
            return Ok((name.clone(), false));
        }

        let image = self.config.image.as_ref().ok_or_else(|| {
            CoreError::Validation(
                "docker transport requires an image or an existing container name".to_string(),
            )
        })?;

        let name = format!("mcp-{}", uuid::Uuid::new_v4().simple());
        let options = CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        };
        let container_config = Config {
            image: Some(image.clone()),
            cmd: self.config.command.clone(),
            env: if self.config.env.is_empty() {
                None
            } else {
                Some(self.config.env.clone())
            },
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let created = docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                CoreError::Connection(format!("failed to create container from '{}': {}", image, e))
            })?;
        if let Err(e) = docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(CoreError::Connection(format!(
                "failed to start container: {}",
                e
            )));
        }
        Ok((created.id, true))
    }

    async fn cleanup_container(docker: &Docker, container_id: &str) {
        if let Err(e) = docker
            .stop_container(
                container_id,
                Some(StopContainerOptions { t: STOP_GRACE_SECS }),
            )
            .await
        {
            debug!(container = %container_id, error = %e, "container stop failed");
        }
        if let Err(e) = docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = %container_id, error = %e, "container removal failed");
        }
    }
}

#[async_trait]
impl Transport for DockerTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return Err(CoreError::Connection(
                "docker transport already connected".to_string(),
            ));
        }

        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| CoreError::Connection(format!("docker daemon unreachable: {}", e)))?;

        let (container_id, ephemeral) = self.resolve_container(&docker).await?;

        let attach = docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await;
        let attach = match attach {
            Ok(results) => results,
            Err(e) => {
                if ephemeral {
                    Self::cleanup_container(&docker, &container_id).await;
                }
                return Err(CoreError::Connection(format!(
                    "failed to attach to container {}: {}",
                    container_id, e
                )));
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let connected = self.connected.clone();
        let last_error = self.last_error.clone();
        let peer = container_id.clone();
        let mut output = attach.output;
        let reader = tokio::spawn(async move {
            let mut framer = FrameBuffer::new();
            let reason = loop {
                match output.next().await {
                    Some(Ok(LogOutput::StdOut { message }))
                    | Some(Ok(LogOutput::Console { message })) => {
                        if !forward_chunk(&mut framer, &message, &events_tx, &peer).await {
                            break "event channel dropped".to_string();
                        }
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        warn!(
                            container = %peer,
                            stderr = %String::from_utf8_lossy(&message),
                            "container stderr"
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("attach stream error: {}", e),
                    None => break "attach stream ended".to_string(),
                }
            };
            debug!(container = %peer, reason = %reason, "docker transport closing");
            connected.store(false, Ordering::SeqCst);
            *last_error.lock().expect("last_error poisoned") = Some(reason.clone());
            let _ = events_tx.send(TransportEvent::Closed { reason }).await;
        });

        *slot = Some(DockerInner {
            docker,
            container_id,
            ephemeral,
            input: attach.input,
            reader,
        });
        self.connected.store(true, Ordering::SeqCst);
        Ok(events_rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut slot = self.inner.lock().await;
        if let Some(inner) = slot.take() {
            inner.reader.abort();
            if inner.ephemeral {
                Self::cleanup_container(&inner.docker, &inner.container_id).await;
            }
        }
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let mut slot = self.inner.lock().await;
        let inner = slot
            .as_mut()
            .ok_or_else(|| CoreError::Connection("docker transport not connected".to_string()))?;

        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        let write = async {
            inner.input.write_all(&bytes).await?;
            inner.input.flush().await
        };
        if let Err(e) = write.await {
            let text = format!("write to container stdin failed: {}", e);
            self.connected.store(false, Ordering::SeqCst);
            *self.last_error.lock().expect("last_error poisoned") = Some(text.clone());
            return Err(CoreError::Connection(text));
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

    #[tokio::test]
    async fn test_send_when_not_connected() {
        let transport = DockerTransport::new(DockerConfig {
            container: Some("mcp-tools".to_string()),
            image: None,
            command: None,
            env: vec![],
        });

        let message = JsonRpcMessage::Request(crate::rpc::protocol::JsonRpcRequest::new(
            1, "ping", None,
        ));
        let err = transport.send(&message).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[test]
    fn test_ephemeral_names_are_unique() {
        let a = format!("mcp-{}", uuid::Uuid::new_v4().simple());
        let b = format!("mcp-{}", uuid::Uuid::new_v4().simple());
        assert_ne!(a, b);
    }
}
