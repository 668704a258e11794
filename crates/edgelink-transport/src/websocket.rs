//! tokio-tungstenite adapter
//!
//! Splits a WebSocket into a [`FrameSink`] and a [`FrameSource`]. Envelopes travel
//! as text frames; control frames are consumed here and never surface as frames.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::{FrameSink, FrameSource, TransportError, TransportResult};

/// Write half of a tungstenite WebSocket
pub struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Read half of a tungstenite WebSocket
pub struct WebSocketSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Split an established WebSocket into frame halves
pub fn split<S>(ws: WebSocketStream<S>) -> (WebSocketSink<S>, WebSocketSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (sink, source) = ws.split();
    (
        WebSocketSink { inner: sink },
        WebSocketSource { inner: source },
    )
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::ConnectionClosed
            }
            tungstenite::Error::Io(io) => TransportError::IoError(io),
            tungstenite::Error::Protocol(p) => TransportError::ProtocolError(p.to_string()),
            other => TransportError::WebSocketError(other.to_string()),
        }
    }
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: String) -> TransportResult<()> {
        self.inner.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        match self.inner.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv_frame(&mut self) -> TransportResult<Option<String>> {
        while let Some(result) = self.inner.next().await {
            match result {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary frame");
                    }
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong replies are queued by tungstenite itself
                    trace!("WebSocket control frame");
                }
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket close received: {:?}", frame);
                    return Ok(None);
                }
                Ok(Message::Frame(_)) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }
}
