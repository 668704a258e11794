//! Serves one tunnel session on the agent
//!
//! The read loop answers heartbeats inline and hands everything else off:
//! requests run on their own tasks, streams get a bridge task between the
//! tunnel and the local endpoint. Only the write serializer orders the wire.
//! Writes made from the read loop are bounded by the idle deadline, so a
//! manager that stops reading cannot keep the session alive.

use edgelink_connection::{
    overflow_close, ConnectionError, DataOutcome, StreamConfig, StreamError, StreamSession,
    StreamTable, WriteSerializer,
};
use edgelink_proto::{Envelope, EnvelopeCodec, Message, ProxiedRequest, RemoteError, WsClose, WsTarget};
use edgelink_transport::FramedConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::executor::LocalExecutor;
use crate::local_stream::{DuplexChannel, LocalStreamOpener};

/// WebSocket close code sent when the local endpoint could not be opened
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Treat the link as dead after this long without a heartbeat
    pub idle_timeout: Duration,
    pub streams: StreamConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(45),
            streams: StreamConfig::default(),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The manager closed the link
    PeerClosed,
    /// No heartbeat within the idle timeout
    IdleTimeout,
    Transport(String),
    Shutdown,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::PeerClosed => write!(f, "manager closed the connection"),
            SessionEnd::IdleTimeout => write!(f, "no heartbeat from manager"),
            SessionEnd::Transport(e) => write!(f, "transport error: {}", e),
            SessionEnd::Shutdown => write!(f, "agent shutting down"),
        }
    }
}

/// State shared by the tasks of one session
struct Session {
    serializer: Arc<WriteSerializer>,
    streams: Arc<StreamTable>,
    cancel: CancellationToken,
}

/// Routes inbound envelopes to local work
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn LocalExecutor>,
    opener: Arc<dyn LocalStreamOpener>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn LocalExecutor>,
        opener: Arc<dyn LocalStreamOpener>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            executor,
            opener,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Serve `connection` until it ends or `shutdown` fires.
    ///
    /// In-flight work is cancelled and open streams are failed before this
    /// returns.
    pub async fn run(&self, connection: FramedConnection, shutdown: &CancellationToken) -> SessionEnd {
        let FramedConnection {
            sink,
            mut source,
            peer,
        } = connection;

        let serializer = Arc::new(WriteSerializer::new(sink, "agent"));
        let session = Session {
            streams: StreamTable::new(serializer.clone(), self.config.streams.clone(), "agent"),
            serializer: serializer.clone(),
            cancel: shutdown.child_token(),
        };
        let write_closed = serializer.closed_token();

        let idle_timeout = self.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        info!(peer = %peer, "Tunnel session started");

        let end = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                _ = &mut idle => break SessionEnd::IdleTimeout,
                _ = write_closed.cancelled() => break SessionEnd::Transport("write failed".to_string()),
                frame = source.recv_frame() => frame,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break SessionEnd::PeerClosed,
                Err(e) => break SessionEnd::Transport(e.to_string()),
            };

            let envelope = match EnvelopeCodec::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping bad frame from manager: {}", e);
                    continue;
                }
            };

            if matches!(envelope.message, Message::Heartbeat) {
                idle.as_mut().reset(Instant::now() + idle_timeout);
            }

            self.dispatch(&session, envelope, idle.deadline()).await;
        };

        match &end {
            SessionEnd::Shutdown => info!(peer = %peer, "Tunnel session stopped"),
            other => warn!(peer = %peer, "Tunnel session ended: {}", other),
        }

        session.cancel.cancel();
        let failed = session.streams.close_all(&end.to_string());
        if failed > 0 {
            debug!("Failed {} open streams", failed);
        }
        serializer.close().await;

        end
    }

    /// Handle one inbound envelope; inline writes give up at `deadline`
    async fn dispatch(&self, session: &Session, envelope: Envelope, deadline: Instant) {
        let kind = envelope.kind();
        let Envelope { id, message } = envelope;

        match message {
            Message::Heartbeat => {
                if let Err(e) = session
                    .serializer
                    .send_until(&Envelope::heartbeat_ack(&id), deadline)
                    .await
                {
                    debug!("Could not acknowledge heartbeat {}: {}", id, e);
                }
            }
            Message::Request(request) => {
                let executor = self.executor.clone();
                let serializer = session.serializer.clone();
                let cancel = session.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            trace!(id = %id, "Request abandoned, session ended");
                        }
                        _ = execute(executor, serializer, id.clone(), request) => {}
                    }
                });
            }
            Message::WsStart(target) => {
                let stream = match session.streams.open(&id) {
                    Ok(stream) => stream,
                    Err(StreamError::Duplicate(_)) => {
                        warn!(id = %id, "Stream already open, ignoring ws_start");
                        return;
                    }
                    Err(e) => {
                        debug!(id = %id, "Cannot open stream: {}", e);
                        return;
                    }
                };

                let opener = self.opener.clone();
                let cancel = session.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = bridge_stream(opener, stream, target) => {}
                    }
                });
            }
            Message::WsData(data) => match session.streams.data_in(&id, data.data) {
                DataOutcome::Overflow => {
                    warn!(id = %id, "Stream reader fell behind, closing stream");
                    if let Err(e) = session
                        .serializer
                        .send_until(&Envelope::ws_close(&id, overflow_close()), deadline)
                        .await
                    {
                        debug!("Could not close overflowed stream {}: {}", id, e);
                    }
                }
                DataOutcome::Unknown => trace!(id = %id, "Data for unknown stream, dropping"),
                DataOutcome::Delivered | DataOutcome::Discarded => {}
            },
            Message::WsClose(_) => {
                if session.streams.close(&id) {
                    debug!(id = %id, "Stream closed by manager");
                }
            }
            Message::Response(_) | Message::HeartbeatAck => {
                warn!(id = %id, "Unexpected {} from manager, dropping", kind);
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish()
    }
}

/// Run one request locally and send the outcome back under the same id
async fn execute(
    executor: Arc<dyn LocalExecutor>,
    serializer: Arc<WriteSerializer>,
    id: String,
    request: ProxiedRequest,
) {
    debug!(id = %id, method = %request.method, path = %request.path, "Executing request");

    let reply = match executor.execute(request).await {
        Ok(response) => Envelope::response(&id, response),
        Err(e) => {
            warn!(id = %id, "Local execution failed: {}", e);
            Envelope::error_response(&id, e.to_remote())
        }
    };

    match serializer.send(&reply).await {
        Ok(()) => {}
        Err(ConnectionError::Codec(e)) => {
            warn!(id = %id, "Response could not be encoded: {}", e);
            let fallback = Envelope::error_response(&id, RemoteError::new("encoding_failed", e.to_string()));
            if let Err(e) = serializer.send(&fallback).await {
                debug!(id = %id, "Could not report encoding failure: {}", e);
            }
        }
        Err(e) => {
            debug!(id = %id, "Response not sent: {}", e);
        }
    }
}

/// Pump a tunnel stream and a local endpoint into each other until either
/// side ends
async fn bridge_stream(opener: Arc<dyn LocalStreamOpener>, stream: StreamSession, target: WsTarget) {
    let id = stream.id().to_string();

    let DuplexChannel { tx, mut rx } = match opener.open(&target).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(id = %id, path = %target.path, "Could not open local stream: {}", e);
            let _ = stream
                .close(WsClose::with_reason(CLOSE_INTERNAL_ERROR, e.to_string()))
                .await;
            return;
        }
    };
    debug!(id = %id, path = %target.path_and_query(), "Local stream opened");

    let (mut reader, writer) = stream.split();

    // Manager → local; dropping `tx` closes the local endpoint
    let inbound = async move {
        loop {
            match reader.recv().await {
                Ok(Some(chunk)) => {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Stream {} failed: {}", reader.id(), e);
                    break;
                }
            }
        }
    };

    // Local → manager; local EOF becomes ws_close
    let outbound = async move {
        while let Some(chunk) = rx.recv().await {
            if writer.send(chunk).await.is_err() {
                return;
            }
        }
        let _ = writer.close(WsClose::normal()).await;
    };

    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
    }

    trace!(id = %id, "Stream bridge ended");
}
