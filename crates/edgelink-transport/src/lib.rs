//! Frame transport abstraction for the edge tunnel
//!
//! The tunnel moves one encoded envelope per text frame over a duplex,
//! order-preserving channel. This crate defines the two halves of such a
//! channel and provides implementations for:
//!
//! - **WebSocket** (tokio-tungstenite): what agents dial in production
//! - **Memory**: an in-process pair used by tests and embedded setups

pub mod connector;
pub mod memory;
pub mod websocket;

pub use connector::{ConnectError, Connector, FramedConnection, WebSocketConnector};
pub use memory::{MemoryConnector, MemoryEnd};

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Write half of a framed duplex channel
#[async_trait]
pub trait FrameSink: Send {
    /// Send one complete frame
    async fn send_frame(&mut self, frame: String) -> TransportResult<()>;

    /// Close the write half; the peer's source observes end-of-stream
    async fn close(&mut self) -> TransportResult<()>;
}

/// Read half of a framed duplex channel
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame, `Ok(None)` once the peer has gone away
    async fn recv_frame(&mut self) -> TransportResult<Option<String>>;
}

#[async_trait]
impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    async fn send_frame(&mut self, frame: String) -> TransportResult<()> {
        (**self).send_frame(frame).await
    }

    async fn close(&mut self) -> TransportResult<()> {
        (**self).close().await
    }
}

#[async_trait]
impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    async fn recv_frame(&mut self) -> TransportResult<Option<String>> {
        (**self).recv_frame().await
    }
}
