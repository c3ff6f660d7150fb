//! SSH transport
//!
//! Establishes an SSH session, executes the configured remote command, and
//! frames newline-delimited JSON-RPC over the remote process stdio exactly
//! like the stdio transport. Extended data (remote stderr) is forwarded to
//! the logger. Keepalives run every 30 s; session or channel errors are
//! reported the same way as a local process exit.

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::model::{SshConfig, SshCredential};
use crate::rpc::protocol::JsonRpcMessage;

use super::framing::{forward_chunk, FrameBuffer};
use super::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Host key pinning is the deployment's concern; the core accepts
        // whatever the configured host presents.
        Ok(true)
    }
}

struct SshInner {
    session: client::Handle<ClientHandler>,
    outgoing: mpsc::Sender<Vec<u8>>,
    io_task: JoinHandle<()>,
}

/// Transport over a remote command's stdio behind an SSH session.
pub struct SshTransport {
    config: SshConfig,
    inner: Mutex<Option<SshInner>>,
    connected: Arc<AtomicBool>,
    last_error: Arc<StdMutex<Option<String>>>,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(StdMutex::new(None)),
        }
    }

    async fn open_session(&self) -> Result<client::Handle<ClientHandler>> {
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        });

        let addr_str = format!("{}:{}", self.config.host, self.config.port);
        let mut addrs = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|e| CoreError::Connection(format!("could not resolve {}: {}", addr_str, e)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| CoreError::Connection(format!("could not resolve {}", addr_str)))?;

        let mut session = client::connect(ssh_config, addr, ClientHandler)
            .await
            .map_err(|e| CoreError::Connection(format!("ssh connect to {} failed: {}", addr_str, e)))?;

        let authenticated = match &self.config.credential {
            SshCredential::Password { password } => session
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| CoreError::Connection(format!("ssh authentication failed: {}", e)))?,
            SshCredential::PrivateKey {
                private_key,
                passphrase,
            } => {
                let key_pair = russh_keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| {
                        CoreError::Connection(format!("could not decode ssh private key: {}", e))
                    })?;
                session
                    .authenticate_publickey(&self.config.username, Arc::new(key_pair))
                    .await
                    .map_err(|e| CoreError::Connection(format!("ssh authentication failed: {}", e)))?
            }
        };
        if !authenticated {
            return Err(CoreError::Connection(format!(
                "ssh authentication rejected for {}@{}",
                self.config.username, self.config.host
            )));
        }
        Ok(session)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return Err(CoreError::Connection(
                "ssh transport already connected".to_string(),
            ));
        }

        let session = self.open_session().await?;

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| CoreError::Connection(format!("ssh channel open failed: {}", e)))?;
        if let Err(e) = channel.exec(true, self.config.command.as_str()).await {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(CoreError::Connection(format!(
                "ssh exec '{}' failed: {}",
                self.config.command, e
            )));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(EVENT_CHANNEL_CAPACITY);

        let connected = self.connected.clone();
        let last_error = self.last_error.clone();
        let peer = format!("{}@{}", self.config.username, self.config.host);
        let io_task = tokio::spawn(async move {
            let mut framer = FrameBuffer::new();
            let reason = loop {
                tokio::select! {
                    outbound = outgoing_rx.recv() => match outbound {
                        Some(bytes) => {
                            if let Err(e) = channel.data(&bytes[..]).await {
                                break format!("ssh channel write failed: {}", e);
                            }
                        }
                        // The transport was dropped or disconnected.
                        None => break "ssh transport disconnected".to_string(),
                    },
                    inbound = channel.wait() => match inbound {
                        Some(ChannelMsg::Data { ref data }) => {
                            if !forward_chunk(&mut framer, data, &events_tx, &peer).await {
                                break "event channel dropped".to_string();
                            }
                        }
                        Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                            warn!(
                                peer = %peer,
                                stderr = %String::from_utf8_lossy(data),
                                "remote stderr"
                            );
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!(peer = %peer, exit_status, "remote command exited");
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                            break "ssh channel closed".to_string();
                        }
                        Some(_) => {}
                        None => break "ssh session ended".to_string(),
                    },
                }
            };
            debug!(peer = %peer, reason = %reason, "ssh transport closing");
            connected.store(false, Ordering::SeqCst);
            *last_error.lock().expect("last_error poisoned") = Some(reason.clone());
            let _ = events_tx.send(TransportEvent::Closed { reason }).await;
        });

        *slot = Some(SshInner {
            session,
            outgoing: outgoing_tx,
            io_task,
        });
        self.connected.store(true, Ordering::SeqCst);
        Ok(events_rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut slot = self.inner.lock().await;
        if let Some(inner) = slot.take() {
            // Closing the outgoing channel lets the io task wind down before
            // the session teardown races it.
            drop(inner.outgoing);
            let _ = inner
                .session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            inner.io_task.abort();
        }
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let outgoing = {
            let slot = self.inner.lock().await;
            slot.as_ref()
                .map(|inner| inner.outgoing.clone())
                .ok_or_else(|| CoreError::Connection("ssh transport not connected".to_string()))?
        };

        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        outgoing
            .send(bytes)
            .await
            .map_err(|_| CoreError::Connection("ssh channel closed".to_string()))
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
    async fn test_unresolvable_host_is_connection_error() {
        let transport = SshTransport::new(SshConfig {
            host: "host.invalid.".to_string(),
            port: 22,
            username: "ops".to_string(),
            credential: SshCredential::Password {
                password: "secret".to_string(),
            },
            command: "mcp-server".to_string(),
        });

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, CoreError::Connection(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_when_not_connected() {
        let transport = SshTransport::new(SshConfig {
            host: "localhost".to_string(),
            port: 22,
            username: "ops".to_string(),
            credential: SshCredential::Password {
                password: "secret".to_string(),
            },
            command: "mcp-server".to_string(),
        });

        let message = JsonRpcMessage::Request(crate::rpc::protocol::JsonRpcRequest::new(
            1, "ping", None,
        ));
        let err = transport.send(&message).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[test]
    fn test_bad_key_material_is_rejected() {
        let result = russh_keys::decode_secret_key("not a key", None);
        assert!(result.is_err());
    }
}
