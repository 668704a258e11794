//! Exclusive, FIFO writer for one physical connection

use edgelink_proto::{Envelope, EnvelopeCodec};
use edgelink_transport::FrameSink;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::ConnectionError;

/// Upper bound on flushing the close handshake to a peer that may be gone
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Serializes envelope writes onto a single [`FrameSink`].
///
/// Writers queue on a fair (FIFO) async mutex, so frames are never
/// interleaved. Once closed, every pending and future `send` fails with
/// [`ConnectionError::Closed`].
pub struct WriteSerializer {
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    closed: CancellationToken,
    label: String,
}

impl WriteSerializer {
    pub fn new(sink: Box<dyn FrameSink>, label: impl Into<String>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            closed: CancellationToken::new(),
            label: label.into(),
        }
    }

    /// Encode and transmit one envelope
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        // Encode outside the lock so large bodies don't stall other writers
        let frame = EnvelopeCodec::encode(envelope)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ConnectionError::Closed),
            result = self.write(frame) => {
                if result.is_ok() {
                    trace!("[{}] Sent {} {}", self.label, envelope.kind(), envelope.id);
                }
                result
            }
        }
    }

    /// [`send`](Self::send), giving up at `deadline`.
    ///
    /// Fails with [`ConnectionError::Timeout`] if the frame could not be handed
    /// to the transport in time, e.g. because the peer stopped reading. The
    /// connection stays open; liveness is the heartbeat's call.
    pub async fn send_until(
        &self,
        envelope: &Envelope,
        deadline: Instant,
    ) -> Result<(), ConnectionError> {
        tokio::time::timeout_at(deadline, self.send(envelope))
            .await
            .unwrap_or(Err(ConnectionError::Timeout))
    }

    async fn write(&self, frame: String) -> Result<(), ConnectionError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ConnectionError::Closed)?;

        if let Err(e) = sink.send_frame(frame).await {
            warn!("[{}] Transport write failed: {}", self.label, e);
            guard.take();
            self.closed.cancel();
            return Err(ConnectionError::Closed);
        }

        Ok(())
    }

    /// Mark the connection closed and release the transport.
    ///
    /// Queued writers wake up with [`ConnectionError::Closed`].
    pub async fn close(&self) {
        if self.closed.is_cancelled() && self.sink.lock().await.is_none() {
            return;
        }
        self.closed.cancel();

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            debug!("[{}] Closing transport sink", self.label);
            match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[{}] Error closing sink: {}", self.label, e),
                Err(_) => debug!("[{}] Sink did not close in time, dropping it", self.label),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the serializer closes
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl std::fmt::Debug for WriteSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSerializer")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}
