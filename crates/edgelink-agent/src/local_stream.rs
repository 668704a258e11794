//! Local streaming endpoints
//!
//! A `ws_start` from the manager is served by opening a stream next to the
//! agent (logs, stats, attach...). The opener hands back a pair of byte
//! channels; closing either side ends the stream.

use async_trait::async_trait;
use bytes::Bytes;
use edgelink_proto::WsTarget;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;

use crate::DispatchError;

/// Chunks buffered in each direction of a local stream
const DEFAULT_CAPACITY: usize = 64;

/// Both directions of an opened local stream
#[derive(Debug)]
pub struct DuplexChannel {
    /// Chunks written to the local endpoint; drop to close it
    pub tx: mpsc::Sender<Bytes>,
    /// Chunks produced by the local endpoint; `None` once it ended
    pub rx: mpsc::Receiver<Bytes>,
}

impl DuplexChannel {
    /// Two channels wired to each other, for in-process endpoints
    pub fn pair(capacity: usize) -> (DuplexChannel, DuplexChannel) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            DuplexChannel { tx: a_tx, rx: a_rx },
            DuplexChannel { tx: b_tx, rx: b_rx },
        )
    }
}

/// Opens a local stream for a `ws_start` target
#[async_trait]
pub trait LocalStreamOpener: Send + Sync {
    async fn open(&self, target: &WsTarget) -> Result<DuplexChannel, DispatchError>;
}

/// Opens local WebSocket endpoints under a base URL (e.g. `ws://127.0.0.1:2375`)
#[derive(Debug, Clone)]
pub struct WebSocketStreamOpener {
    base: Url,
    capacity: usize,
}

impl WebSocketStreamOpener {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn target_url(&self, target: &WsTarget) -> Url {
        let mut url = self.base.clone();
        url.set_path(&target.path);
        url.set_query(target.query.as_deref());
        url
    }
}

#[async_trait]
impl LocalStreamOpener for WebSocketStreamOpener {
    async fn open(&self, target: &WsTarget) -> Result<DuplexChannel, DispatchError> {
        let url = self.target_url(target);
        debug!("Opening local stream {}", url);

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| DispatchError::Unavailable(format!("failed to open {}: {}", url, e)))?;
        let (mut write, mut read) = ws.split();

        let (to_local_tx, mut to_local_rx) = mpsc::channel::<Bytes>(self.capacity);
        let (from_local_tx, from_local_rx) = mpsc::channel::<Bytes>(self.capacity);

        // Tunnel → local
        tokio::spawn(async move {
            while let Some(chunk) = to_local_rx.recv().await {
                let message = match String::from_utf8(chunk.to_vec()) {
                    Ok(text) => Message::Text(text),
                    Err(e) => Message::Binary(e.into_bytes()),
                };
                if let Err(e) = write.send(message).await {
                    debug!("Local stream write failed: {}", e);
                    return;
                }
            }
            let _ = write.close().await;
        });

        // Local → tunnel
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let chunk = match message {
                    Ok(Message::Text(text)) => Bytes::from(text),
                    Ok(Message::Binary(data)) => Bytes::from(data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Local stream read failed: {}", e);
                        break;
                    }
                };
                if from_local_tx.send(chunk).await.is_err() {
                    break;
                }
            }
            trace!("Local stream reader ended");
        });

        Ok(DuplexChannel {
            tx: to_local_tx,
            rx: from_local_rx,
        })
    }
}
