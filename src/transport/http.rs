//! HTTP transport
//!
//! One HTTP POST per JSON-RPC call, content type `application/json`,
//! against a configured base URL with configured headers. Each response
//! body is parsed as JSON-RPC and pushed into the same event stream the
//! framed transports use, so the multiplexer correlates uniformly. There is
//! no long-lived reader and no support for server-initiated notifications;
//! one showing up in a response body is logged and ignored.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::model::HttpConfig;
use crate::rpc::protocol::JsonRpcMessage;

use super::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};

struct HttpInner {
    client: reqwest::Client,
    url: reqwest::Url,
    events_tx: mpsc::Sender<TransportEvent>,
}

/// Transport over per-request HTTP POSTs.
pub struct HttpTransport {
    config: HttpConfig,
    connect_timeout: Duration,
    inner: Mutex<Option<HttpInner>>,
    connected: Arc<AtomicBool>,
    last_error: Arc<StdMutex<Option<String>>>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig, core: &CoreConfig) -> Self {
        Self {
            config,
            connect_timeout: core.connection_timeout(),
            inner: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(StdMutex::new(None)),
        }
    }

    fn header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_str(name)
                .map_err(|e| CoreError::Validation(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CoreError::Validation(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return Err(CoreError::Connection(
                "http transport already connected".to_string(),
            ));
        }

        let url = reqwest::Url::parse(&self.config.url)
            .map_err(|e| CoreError::Validation(format!("invalid URL '{}': {}", self.config.url, e)))?;
        let client = reqwest::Client::builder()
            .default_headers(self.header_map()?)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| CoreError::Connection(format!("failed to build HTTP client: {}", e)))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *slot = Some(HttpInner {
            client,
            url,
            events_tx,
        });
        self.connected.store(true, Ordering::SeqCst);
        Ok(events_rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the event sender closes the stream; the multiplexer
        // drains its pending map when it sees the channel end.
        self.inner.lock().await.take();
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let (client, url, events_tx) = {
            let slot = self.inner.lock().await;
            let inner = slot
                .as_ref()
                .ok_or_else(|| CoreError::Connection("http transport not connected".to_string()))?;
            (
                inner.client.clone(),
                inner.url.clone(),
                inner.events_tx.clone(),
            )
        };

        let response = client
            .post(url)
            .json(message)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                let text = format!("http request failed: {}", e);
                *self.last_error.lock().expect("last_error poisoned") = Some(text.clone());
                CoreError::Connection(text)
            })?;

        match message {
            JsonRpcMessage::Request(_) => {
                let reply: JsonRpcMessage = response.json().await.map_err(|e| {
                    CoreError::Connection(format!("http response was not JSON-RPC: {}", e))
                })?;
                match reply {
                    JsonRpcMessage::Response(_) => {
                        if events_tx.send(TransportEvent::Message(reply)).await.is_err() {
                            return Err(CoreError::Connection(
                                "http transport event stream closed".to_string(),
                            ));
                        }
                    }
                    JsonRpcMessage::Notification(n) => {
                        warn!(
                            method = %n.method,
                            "server-initiated notification on http transport, ignoring"
                        );
                    }
                    JsonRpcMessage::Request(r) => {
                        warn!(
                            method = %r.method,
                            "server-initiated request on http transport, ignoring"
                        );
                    }
                }
            }
            JsonRpcMessage::Notification(_) => {
                debug!("notification delivered over http, response body ignored");
            }
            JsonRpcMessage::Response(_) => {
                return Err(CoreError::Internal(
                    "core never sends responses".to_string(),
                ));
            }
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
