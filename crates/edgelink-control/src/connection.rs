//! One live tunnel from an agent
//!
//! A [`TunnelConnection`] owns the physical link for one environment. It runs
//! two tasks: the read loop, which dispatches inbound envelopes, and the
//! heartbeat driver, which probes the agent and tears the connection down when
//! acknowledgements stop. Callers share it through `Arc` and issue requests
//! and open streams concurrently.
//!
//! Neither task waits on the wire: replies from the read loop and heartbeats
//! are written from their own tasks, so an agent that stops reading is still
//! detected and dropped on schedule.

use chrono::{DateTime, Utc};
use edgelink_connection::{
    overflow_close, ConnectionError, DataOutcome, HealthState, HeartbeatConfig, HeartbeatMonitor,
    StreamConfig, StreamError, StreamSession, StreamTable, Transition, WriteSerializer,
};
use edgelink_proto::{
    Envelope, EnvelopeCodec, Message, ProxiedRequest, ProxiedResponse, ResponsePayload, WsTarget,
};
use edgelink_transport::{FrameSource, FramedConnection};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::pending_requests::{PendingError, PendingRequests};
use crate::TunnelError;

/// Per-connection settings
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub heartbeat: HeartbeatConfig,
    pub streams: StreamConfig,
}

/// Why a connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same environment took over
    Replaced,
    HeartbeatTimeout,
    PeerDisconnected,
    Transport(String),
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Replaced => write!(f, "replaced by a newer connection"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::PeerDisconnected => write!(f, "agent disconnected"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Shutdown => write!(f, "manager shutting down"),
        }
    }
}

/// Point-in-time view of a connection, for listings
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub environment_id: String,
    pub connection_id: String,
    pub peer: String,
    pub state: HealthState,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub pending_requests: usize,
    pub open_streams: usize,
}

/// Manager side of one tunnel
pub struct TunnelConnection {
    environment_id: String,
    connection_id: String,
    peer: String,
    connected_at: DateTime<Utc>,
    serializer: Arc<WriteSerializer>,
    pending: PendingRequests,
    streams: Arc<StreamTable>,
    monitor: Mutex<HeartbeatMonitor>,
    health: watch::Sender<HealthState>,
    last_seen: watch::Sender<DateTime<Utc>>,
    /// Bound on writes that nobody waits for
    write_timeout: Duration,
    next_id: AtomicU64,
    close_reason: OnceLock<CloseReason>,
    shutdown: CancellationToken,
}

impl TunnelConnection {
    /// Take over an authenticated transport and start serving it.
    ///
    /// The handshake is complete once the agent's credential was accepted, so
    /// the connection starts `online`.
    pub fn spawn(
        environment_id: impl Into<String>,
        connection: FramedConnection,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let environment_id = environment_id.into();
        let connection_id = Uuid::new_v4().to_string();
        let label = format!("{}/{}", environment_id, &connection_id[..8]);
        let FramedConnection { sink, source, peer } = connection;

        let serializer = Arc::new(WriteSerializer::new(sink, label.clone()));
        let streams = StreamTable::new(serializer.clone(), config.streams, label.clone());

        let write_timeout = config.heartbeat.degraded_after;
        let mut monitor = HeartbeatMonitor::new(config.heartbeat);
        monitor.on_handshake(Instant::now());
        let (health, _) = watch::channel(monitor.state());

        let now = Utc::now();
        let conn = Arc::new(Self {
            environment_id,
            connection_id,
            peer,
            connected_at: now,
            serializer,
            pending: PendingRequests::new(label),
            streams,
            monitor: Mutex::new(monitor),
            health,
            last_seen: watch::channel(now).0,
            write_timeout,
            next_id: AtomicU64::new(1),
            close_reason: OnceLock::new(),
            shutdown: CancellationToken::new(),
        });

        info!(
            environment_id = %conn.environment_id,
            connection_id = %conn.connection_id,
            peer = %conn.peer,
            "✅ Tunnel connection online"
        );

        tokio::spawn(conn.clone().read_loop(source));
        tokio::spawn(conn.clone().heartbeat_loop());
        conn
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn health(&self) -> HealthState {
        *self.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<HealthState> {
        self.health.subscribe()
    }

    /// Last time the agent acknowledged a heartbeat (or connected)
    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.borrow()
    }

    /// Watch `last_seen` advance as acknowledgements arrive
    pub fn subscribe_last_seen(&self) -> watch::Receiver<DateTime<Utc>> {
        self.last_seen.subscribe()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.get()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the connection has been torn down
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            environment_id: self.environment_id.clone(),
            connection_id: self.connection_id.clone(),
            peer: self.peer.clone(),
            state: self.health(),
            connected_at: self.connected_at,
            last_seen: self.last_seen(),
            pending_requests: self.pending_count(),
            open_streams: self.stream_count(),
        }
    }

    /// Allocate a fresh stream id on this connection
    pub fn next_stream_id(&self) -> String {
        format!("s{}", self.next_seq())
    }

    /// Send a request to the agent and wait for its response.
    ///
    /// `timeout` covers the whole exchange, including waiting for the link to
    /// accept the request.
    pub async fn request(
        &self,
        request: ProxiedRequest,
        timeout: Duration,
    ) -> Result<ProxiedResponse, TunnelError> {
        self.ensure_routable()?;

        let id = format!("r{}", self.next_seq());
        let pending = self
            .pending
            .register(&id, timeout)
            .map_err(|e| match e {
                PendingError::DuplicateId(id) => TunnelError::DuplicateId(id),
                PendingError::Closed => TunnelError::ConnectionClosed,
            })?;

        debug!(
            environment_id = %self.environment_id,
            id = %id,
            "Proxying {} {}",
            request.method,
            request.path
        );

        // Dropping `pending` on failure releases the id
        self.serializer
            .send_until(&Envelope::request(&id, request), pending.deadline())
            .await
            .map_err(|e| self.send_error(e))?;

        pending.wait().await
    }

    /// Ask the agent to open a local stream and bind it to `stream_id`.
    ///
    /// Returns as soon as `ws_start` is on the wire; the agent reports a
    /// failure to open by closing the stream.
    pub async fn open_stream(
        &self,
        stream_id: &str,
        target: WsTarget,
    ) -> Result<StreamSession, TunnelError> {
        self.ensure_routable()?;

        let session = self.streams.open(stream_id).map_err(|e| match e {
            StreamError::Duplicate(id) => TunnelError::DuplicateId(id),
            _ => TunnelError::ConnectionClosed,
        })?;

        debug!(
            environment_id = %self.environment_id,
            id = %stream_id,
            "Opening stream to {}",
            target.path_and_query()
        );

        if let Err(e) = self
            .serializer
            .send_until(&Envelope::ws_start(stream_id, target), self.write_deadline())
            .await
        {
            self.streams.close(stream_id);
            return Err(self.send_error(e));
        }

        Ok(session)
    }

    /// Tear the connection down; idempotent
    pub async fn close(&self, reason: CloseReason) {
        if self.close_reason.set(reason.clone()).is_err() {
            return;
        }
        let message = reason.to_string();

        self.monitor().close();
        self.health.send_replace(HealthState::Closed);
        self.shutdown.cancel();

        let requests = self.pending.cancel_all(&message);
        let streams = self.streams.close_all(&message);
        self.serializer.close().await;

        info!(
            environment_id = %self.environment_id,
            connection_id = %self.connection_id,
            "Tunnel connection closed: {} ({} requests, {} streams failed)",
            message,
            requests,
            streams
        );
    }

    fn next_seq(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn monitor(&self) -> MutexGuard<'_, HeartbeatMonitor> {
        lock(&self.monitor)
    }

    fn write_deadline(&self) -> Instant {
        Instant::now() + self.write_timeout
    }

    /// Write `envelope` from a task of its own, bounded by the write timeout
    fn send_detached(&self, envelope: Envelope) {
        let serializer = self.serializer.clone();
        let deadline = self.write_deadline();
        let environment_id = self.environment_id.clone();
        tokio::spawn(async move {
            if let Err(e) = serializer.send_until(&envelope, deadline).await {
                debug!(
                    environment_id = %environment_id,
                    "Could not send {} {}: {}",
                    envelope.kind(),
                    envelope.id,
                    e
                );
            }
        });
    }

    fn ensure_routable(&self) -> Result<(), TunnelError> {
        if self.health().is_routable() {
            Ok(())
        } else {
            Err(TunnelError::ConnectionClosed)
        }
    }

    fn send_error(&self, error: ConnectionError) -> TunnelError {
        match error {
            ConnectionError::Closed => match self.close_reason.get() {
                Some(reason) => TunnelError::ConnectionLost(reason.to_string()),
                None => TunnelError::ConnectionClosed,
            },
            ConnectionError::Timeout => TunnelError::Timeout,
            ConnectionError::Codec(e) => TunnelError::InvalidRequest(e.to_string()),
        }
    }

    fn publish(&self, transition: Transition) {
        match transition.to {
            HealthState::Degraded => warn!(
                environment_id = %self.environment_id,
                connection_id = %self.connection_id,
                "Tunnel degraded: heartbeats unanswered"
            ),
            HealthState::Online => info!(
                environment_id = %self.environment_id,
                connection_id = %self.connection_id,
                "Tunnel recovered ({} -> {})",
                transition.from,
                transition.to
            ),
            _ => debug!(
                environment_id = %self.environment_id,
                "Health {} -> {}",
                transition.from,
                transition.to
            ),
        }
        self.health.send_replace(transition.to);
    }

    async fn read_loop(self: Arc<Self>, mut source: Box<dyn FrameSource>) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = source.recv_frame() => frame,
            };

            match frame {
                Ok(Some(frame)) => self.handle_frame(&frame).await,
                Ok(None) => {
                    self.close(CloseReason::PeerDisconnected).await;
                    break;
                }
                Err(e) => {
                    warn!(
                        environment_id = %self.environment_id,
                        "Error reading from tunnel: {}",
                        e
                    );
                    self.close(CloseReason::Transport(e.to_string())).await;
                    break;
                }
            }
        }

        trace!(environment_id = %self.environment_id, "Read loop ended");
    }

    async fn handle_frame(&self, frame: &str) {
        let envelope = match EnvelopeCodec::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    environment_id = %self.environment_id,
                    "Dropping bad frame: {}",
                    e
                );
                return;
            }
        };

        let kind = envelope.kind();
        let Envelope { id, message } = envelope;

        match message {
            Message::Response(payload) => {
                let outcome = match payload {
                    ResponsePayload::Success(response) => Ok(response),
                    ResponsePayload::Failure { error } => Err(TunnelError::Remote {
                        code: error.code,
                        message: error.message,
                    }),
                };
                self.pending.resolve(&id, outcome);
            }
            Message::HeartbeatAck => {
                self.last_seen.send_replace(Utc::now());
                let transition = self.monitor().on_ack(Instant::now());
                if let Some(transition) = transition {
                    self.publish(transition);
                }
            }
            Message::Heartbeat => self.send_detached(Envelope::heartbeat_ack(&id)),
            Message::WsData(data) => {
                if self.streams.data_in(&id, data.data) == DataOutcome::Overflow {
                    self.send_detached(Envelope::ws_close(&id, overflow_close()));
                }
            }
            Message::WsClose(_) => {
                self.streams.close(&id);
            }
            Message::Request(_) | Message::WsStart(_) => {
                warn!(
                    environment_id = %self.environment_id,
                    "Unexpected {} {} from agent, dropping",
                    kind,
                    id
                );
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = self.monitor().config().interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            let deadline = self.monitor().next_deadline();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if in_flight.as_ref().is_some_and(|write| !write.is_finished()) {
                        debug!(
                            environment_id = %self.environment_id,
                            "Previous heartbeat not yet written, skipping"
                        );
                    } else {
                        let id = format!("hb-{}", self.next_seq());
                        self.monitor().on_heartbeat_sent(Instant::now());
                        in_flight = Some(tokio::spawn(self.clone().send_heartbeat(id)));
                    }
                }
                _ = sleep_until(deadline) => {}
            }

            let transition = self.monitor().evaluate(Instant::now());
            match transition {
                Some(transition) if transition.to == HealthState::Closed => {
                    warn!(
                        environment_id = %self.environment_id,
                        connection_id = %self.connection_id,
                        "No heartbeat acknowledgement, closing tunnel"
                    );
                    self.close(CloseReason::HeartbeatTimeout).await;
                    break;
                }
                Some(transition) => self.publish(transition),
                None => {}
            }
        }

        trace!(environment_id = %self.environment_id, "Heartbeat driver ended");
    }

    /// Write one heartbeat; a stalled write is released when the connection closes
    async fn send_heartbeat(self: Arc<Self>, id: String) {
        if let Err(e) = self.serializer.send(&Envelope::heartbeat(&id)).await {
            debug!(
                environment_id = %self.environment_id,
                "Failed to send heartbeat: {}",
                e
            );
            self.close(CloseReason::Transport(e.to_string())).await;
        }
    }
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("environment_id", &self.environment_id)
            .field("connection_id", &self.connection_id)
            .field("health", &self.health())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
