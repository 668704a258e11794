//! In-process transport built on bounded channels

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connector::{ConnectError, Connector, FramedConnection};
use crate::{FrameSink, FrameSource, TransportError, TransportResult};

/// Default number of frames buffered in each direction
pub const DEFAULT_CAPACITY: usize = 256;

/// Write half of a memory channel
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<String>>,
}

/// Read half of a memory channel
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<String>,
}

/// One side of a connected memory pair
#[derive(Debug)]
pub struct MemoryEnd {
    pub sink: MemorySink,
    pub source: MemorySource,
}

impl MemoryEnd {
    pub fn into_connection(self, peer: impl Into<String>) -> FramedConnection {
        FramedConnection {
            sink: Box::new(self.sink),
            source: Box::new(self.source),
            peer: peer.into(),
        }
    }
}

/// Create two connected ends; frames sent on one are received by the other
pub fn pair(capacity: usize) -> (MemoryEnd, MemoryEnd) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    (
        MemoryEnd {
            sink: MemorySink { tx: Some(a_tx) },
            source: MemorySource { rx: a_rx },
        },
        MemoryEnd {
            sink: MemorySink { tx: Some(b_tx) },
            source: MemorySource { rx: b_rx },
        },
    )
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: String) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv_frame(&mut self) -> TransportResult<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

/// Connector that hands the far end of every new pair to an acceptor channel
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    acceptor: mpsc::UnboundedSender<MemoryEnd>,
    capacity: usize,
}

impl MemoryConnector {
    /// Returns the connector and the receiver on which accepted ends arrive
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryEnd>) {
        let (acceptor, accepted) = mpsc::unbounded_channel();
        (
            Self {
                acceptor,
                capacity: DEFAULT_CAPACITY,
            },
            accepted,
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<FramedConnection, ConnectError> {
        let (local, remote) = pair(self.capacity);
        self.acceptor
            .send(remote)
            .map_err(|_| ConnectError::Dial("memory acceptor is gone".to_string()))?;
        Ok(local.into_connection("memory"))
    }
}
