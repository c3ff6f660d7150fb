//! Newline-delimited JSON framing
//!
//! Messages are UTF-8 JSON objects separated by a single `\n`, no length
//! prefix. A partial trailing fragment stays buffered until more bytes
//! arrive. A malformed line is logged and discarded; it never closes the
//! transport.

use tokio::sync::mpsc;
use tracing::warn;

use crate::rpc::protocol::JsonRpcMessage;

use super::TransportEvent;

/// Per-transport input buffer splitting a byte stream into lines.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it produced.
    ///
    /// Empty lines are skipped; the trailing fragment (bytes after the last
    /// `\n`) is retained for the next push.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            match String::from_utf8(line) {
                Ok(text) => lines.push(text),
                Err(e) => warn!(error = %e, "discarding non-UTF-8 frame"),
            }
        }
        lines
    }

    /// Bytes currently held back as a partial line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Parse every complete line in `chunk` and forward the frames.
///
/// Returns false once the receiving side is gone, which tells the reader
/// task to stop.
pub(crate) async fn forward_chunk(
    framer: &mut FrameBuffer,
    chunk: &[u8],
    events: &mpsc::Sender<TransportEvent>,
    peer: &str,
) -> bool {
    for line in framer.push(chunk) {
        match serde_json::from_str::<JsonRpcMessage>(&line) {
            Ok(message) => {
                if events
                    .send(TransportEvent::Message(message))
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            Err(e) => {
                warn!(peer, error = %e, line = %truncate(&line), "discarding malformed frame");
            }
        }
    }
    true
}

fn truncate(line: &str) -> &str {
    let max = 256;
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
