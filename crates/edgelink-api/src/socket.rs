//! axum WebSocket adapter for accepted tunnels

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use edgelink_transport::{FrameSink, FrameSource, FramedConnection, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, trace, warn};

/// Write half of an accepted tunnel socket
pub struct AxumSink {
    inner: SplitSink<WebSocket, Message>,
}

/// Read half of an accepted tunnel socket
pub struct AxumSource {
    inner: SplitStream<WebSocket>,
}

/// Wrap an upgraded socket as a tunnel connection
pub fn into_connection(socket: WebSocket, peer: impl Into<String>) -> FramedConnection {
    let (sink, source) = socket.split();
    FramedConnection {
        sink: Box::new(AxumSink { inner: sink }),
        source: Box::new(AxumSource { inner: source }),
        peer: peer.into(),
    }
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send_frame(&mut self, frame: String) -> TransportResult<()> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        // The peer may already be gone; nothing left to report then
        if let Err(e) = self.inner.close().await {
            debug!("Error closing tunnel socket: {}", e);
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv_frame(&mut self) -> TransportResult<Option<String>> {
        while let Some(result) = self.inner.next().await {
            match result {
                Ok(Message::Text(text)) => return Ok(Some(text.to_string())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => warn!("Dropping non UTF-8 binary frame"),
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("WebSocket control frame");
                }
                Ok(Message::Close(frame)) => {
                    debug!("Tunnel socket closed by agent: {:?}", frame);
                    return Ok(None);
                }
                Err(e) => return Err(TransportError::WebSocketError(e.to_string())),
            }
        }
        Ok(None)
    }
}
