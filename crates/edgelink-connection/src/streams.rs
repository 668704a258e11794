//! Stream table: multiplexed byte streams over one tunnel connection
//!
//! Each open stream is a pair of bounded queues. Inbound chunks (peer → local)
//! are pushed by the connection's read loop with `data_in`; outbound chunks
//! (local → peer) are queued by [`StreamWriter::send`] and drained in order by a
//! per-stream pump task that writes `ws_data` envelopes through the
//! connection's [`WriteSerializer`] and finishes with `ws_close`.
//!
//! The read loop never waits on a slow consumer: a reader that lets its
//! inbound queue fill up is failed with [`StreamError::Overflow`].

use bytes::Bytes;
use edgelink_proto::{Envelope, WsClose};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::serializer::WriteSerializer;
use crate::ConnectionError;

/// WebSocket close code sent when a chunk cannot be encoded (message too big)
const CLOSE_TOO_BIG: u16 = 1009;
/// WebSocket close code sent when the local reader fell behind
const CLOSE_OVERFLOW: u16 = 1008;

/// Stream queue sizing
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Chunks buffered per stream from the peer before the stream is failed
    pub inbound_capacity: usize,
    /// Chunks buffered per stream towards the peer before writers wait
    pub outbound_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 256,
            outbound_capacity: 64,
        }
    }
}

/// Stream errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Stream {0} is already open")]
    Duplicate(String),

    /// The owning connection went away; distinct from a graceful close
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Stream reader fell behind ({0} chunks queued)")]
    Overflow(usize),

    #[error("Chunk could not be encoded: {0}")]
    Encoding(String),

    #[error("Stream closed")]
    Closed,
}

/// What happened to an inbound chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    Delivered,
    /// The local reader is gone; the chunk was dropped
    Discarded,
    /// No open stream with that id (never opened, or raced a close)
    Unknown,
    /// The reader's queue was full; the stream has been failed and the caller
    /// should tell the peer with `ws_close`
    Overflow,
}

enum Outbound {
    Data(Bytes),
    Close(WsClose),
}

struct StreamSlot {
    inbound: mpsc::Sender<Bytes>,
    failure: Arc<OnceLock<StreamError>>,
    pump: CancellationToken,
}

impl StreamSlot {
    /// Record the failure before the inbound sender drops, so the reader sees
    /// the error right after draining its queue
    fn fail(self, error: StreamError) {
        let _ = self.failure.set(error);
        self.pump.cancel();
    }

    fn finish(self) {
        self.pump.cancel();
    }
}

struct TableState {
    sessions: HashMap<String, StreamSlot>,
    closed: bool,
}

/// Open streams of one connection
pub struct StreamTable {
    state: Mutex<TableState>,
    serializer: Arc<WriteSerializer>,
    config: StreamConfig,
    label: String,
}

impl StreamTable {
    pub fn new(
        serializer: Arc<WriteSerializer>,
        config: StreamConfig,
        label: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TableState {
                sessions: HashMap::new(),
                closed: false,
            }),
            serializer,
            config,
            label: label.into(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new stream with the given id
    pub fn open(self: &Arc<Self>, id: &str) -> Result<StreamSession, StreamError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let failure = Arc::new(OnceLock::new());
        let pump = CancellationToken::new();

        {
            let mut state = self.lock();
            if state.closed {
                return Err(StreamError::Closed);
            }
            if state.sessions.contains_key(id) {
                return Err(StreamError::Duplicate(id.to_string()));
            }
            state.sessions.insert(
                id.to_string(),
                StreamSlot {
                    inbound: inbound_tx,
                    failure: failure.clone(),
                    pump: pump.clone(),
                },
            );
        }

        debug!("[{}] Opened stream {}", self.label, id);
        tokio::spawn(Self::pump(self.clone(), id.to_string(), outbound_rx, pump));

        Ok(StreamSession {
            id: id.to_string(),
            reader: StreamReader {
                id: id.to_string(),
                inbound: inbound_rx,
                failure: failure.clone(),
            },
            writer: StreamWriter {
                id: id.to_string(),
                outbound: outbound_tx,
                failure,
            },
        })
    }

    /// Push a chunk received from the peer
    pub fn data_in(&self, id: &str, data: Bytes) -> DataOutcome {
        let mut state = self.lock();
        let Some(slot) = state.sessions.get(id) else {
            warn!("[{}] Dropping data for unknown stream {}", self.label, id);
            return DataOutcome::Unknown;
        };

        match slot.inbound.try_send(data) {
            Ok(()) => DataOutcome::Delivered,
            Err(TrySendError::Closed(_)) => {
                trace!("[{}] Reader of stream {} is gone", self.label, id);
                DataOutcome::Discarded
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[{}] Stream {} reader fell behind, closing stream",
                    self.label, id
                );
                if let Some(slot) = state.sessions.remove(id) {
                    slot.fail(StreamError::Overflow(self.config.inbound_capacity));
                }
                DataOutcome::Overflow
            }
        }
    }

    /// Close a stream because the peer closed it.
    ///
    /// The reader drains what is queued and then observes end-of-stream.
    pub fn close(&self, id: &str) -> bool {
        let slot = self.lock().sessions.remove(id);
        match slot {
            Some(slot) => {
                debug!("[{}] Stream {} closed by peer", self.label, id);
                slot.finish();
                true
            }
            None => {
                debug!("[{}] Close for unknown stream {}", self.label, id);
                false
            }
        }
    }

    /// Fail every open stream; used when the owning connection is lost.
    ///
    /// Readers observe [`StreamError::ConnectionLost`] instead of a clean
    /// end-of-stream. Later `open` calls are refused.
    pub fn close_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, StreamSlot)> = {
            let mut state = self.lock();
            state.closed = true;
            state.sessions.drain().collect()
        };

        let count = drained.len();
        for (id, slot) in drained {
            trace!("[{}] Failing stream {}: {}", self.label, id, reason);
            slot.fail(StreamError::ConnectionLost(reason.to_string()));
        }

        if count > 0 {
            debug!("[{}] Closed {} streams: {}", self.label, count, reason);
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &str) -> Option<StreamSlot> {
        self.lock().sessions.remove(id)
    }

    fn fail(&self, id: &str, error: StreamError) {
        if let Some(slot) = self.remove(id) {
            slot.fail(error);
        }
    }

    async fn send_close(&self, id: &str, close: WsClose) {
        if let Err(e) = self.serializer.send(&Envelope::ws_close(id, close)).await {
            debug!("[{}] Could not send close for stream {}: {}", self.label, id, e);
        }
    }

    async fn pump(
        table: Arc<Self>,
        id: String,
        mut outbound: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = outbound.recv() => next,
            };

            match next {
                Some(Outbound::Data(data)) => {
                    match table.serializer.send(&Envelope::ws_data(&id, data)).await {
                        Ok(()) => {}
                        Err(ConnectionError::Closed | ConnectionError::Timeout) => {
                            table.fail(&id, StreamError::ConnectionLost("connection closed".into()));
                            break;
                        }
                        Err(ConnectionError::Codec(e)) => {
                            warn!("[{}] Stream {} chunk rejected: {}", table.label, id, e);
                            table.fail(&id, StreamError::Encoding(e.to_string()));
                            table
                                .send_close(&id, WsClose::with_reason(CLOSE_TOO_BIG, "chunk too large"))
                                .await;
                            break;
                        }
                    }
                }
                Some(Outbound::Close(close)) => {
                    if table.remove(&id).is_some() {
                        debug!("[{}] Stream {} closed locally", table.label, id);
                        table.send_close(&id, close).await;
                    }
                    break;
                }
                None => {
                    // Every writer handle was dropped
                    if table.remove(&id).is_some() {
                        debug!("[{}] Stream {} released", table.label, id);
                        table.send_close(&id, WsClose::normal()).await;
                    }
                    break;
                }
            }
        }

        trace!("[{}] Stream {} pump ended", table.label, id);
    }
}

impl std::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTable")
            .field("label", &self.label)
            .field("open", &self.len())
            .finish()
    }
}

/// Close code to report to the peer for an overflowed stream
pub fn overflow_close() -> WsClose {
    WsClose::with_reason(CLOSE_OVERFLOW, "stream reader fell behind")
}

/// One open stream.
///
/// Dropping the session (or every [`StreamWriter`] after a split) closes the
/// stream towards the peer.
pub struct StreamSession {
    id: String,
    reader: StreamReader,
    writer: StreamWriter,
}

impl StreamSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next chunk from the peer; `Ok(None)` after a graceful close
    pub async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        self.reader.recv().await
    }

    pub async fn send(&self, data: Bytes) -> Result<(), StreamError> {
        self.writer.send(data).await
    }

    pub async fn close(&self, close: WsClose) -> Result<(), StreamError> {
        self.writer.close(close).await
    }

    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession").field("id", &self.id).finish()
    }
}

/// Receiving half of a stream
pub struct StreamReader {
    id: String,
    inbound: mpsc::Receiver<Bytes>,
    failure: Arc<OnceLock<StreamError>>,
}

impl StreamReader {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        match self.inbound.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None => match self.failure.get() {
                Some(error) => Err(error.clone()),
                None => Ok(None),
            },
        }
    }
}

/// Sending half of a stream
#[derive(Clone)]
pub struct StreamWriter {
    id: String,
    outbound: mpsc::Sender<Outbound>,
    failure: Arc<OnceLock<StreamError>>,
}

impl StreamWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a chunk for the peer; waits while the outbound queue is full
    pub async fn send(&self, data: Bytes) -> Result<(), StreamError> {
        self.outbound
            .send(Outbound::Data(data))
            .await
            .map_err(|_| self.error())
    }

    /// Close the stream after everything already queued has been sent
    pub async fn close(&self, close: WsClose) -> Result<(), StreamError> {
        self.outbound
            .send(Outbound::Close(close))
            .await
            .map_err(|_| self.error())
    }

    fn error(&self) -> StreamError {
        self.failure.get().cloned().unwrap_or(StreamError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgelink_proto::{EnvelopeCodec, Message};
    use edgelink_transport::memory::{self, MemoryEnd};
    use edgelink_transport::FrameSource;
    use std::time::Duration;

    fn table_with_peer(config: StreamConfig) -> (Arc<StreamTable>, MemoryEnd) {
        let (near, far) = memory::pair(256);
        let serializer = Arc::new(WriteSerializer::new(Box::new(near.sink), "test"));
        (StreamTable::new(serializer, config, "test"), far)
    }

    async fn next_envelope(peer: &mut MemoryEnd) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(1), peer.source.recv_frame())
            .await
            .expect("peer should receive a frame")
            .unwrap()
            .unwrap();
        EnvelopeCodec::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order_then_end_of_stream() {
        let (table, _peer) = table_with_peer(StreamConfig::default());
        let mut session = table.open("s1").unwrap();

        for i in 0..10u8 {
            assert_eq!(
                table.data_in("s1", Bytes::from(vec![i; 3])),
                DataOutcome::Delivered
            );
        }
        assert!(table.close("s1"));

        for i in 0..10u8 {
            assert_eq!(session.recv().await.unwrap(), Some(Bytes::from(vec![i; 3])));
        }
        assert_eq!(session.recv().await.unwrap(), None);
        assert!(!table.contains("s1"));
    }

    #[tokio::test]
    async fn test_duplicate_open_rejected() {
        let (table, _peer) = table_with_peer(StreamConfig::default());
        let _session = table.open("logs").unwrap();

        assert_eq!(
            table.open("logs").unwrap_err(),
            StreamError::Duplicate("logs".to_string())
        );
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_stream_frames_are_dropped() {
        let (table, _peer) = table_with_peer(StreamConfig::default());

        assert_eq!(
            table.data_in("never-opened", Bytes::from_static(b"x")),
            DataOutcome::Unknown
        );
        assert!(!table.close("never-opened"));

        let _session = table.open("s2").unwrap();
        assert!(table.close("s2"));
        assert_eq!(
            table.data_in("s2", Bytes::from_static(b"late")),
            DataOutcome::Unknown
        );
    }

    #[tokio::test]
    async fn test_close_all_is_an_error_not_end_of_stream() {
        let (table, _peer) = table_with_peer(StreamConfig::default());
        let mut a = table.open("a").unwrap();
        let mut b = table.open("b").unwrap();

        table.data_in("a", Bytes::from_static(b"buffered"));
        assert_eq!(table.close_all("heartbeat timeout"), 2);

        assert_eq!(a.recv().await.unwrap(), Some(Bytes::from_static(b"buffered")));
        assert_eq!(
            a.recv().await,
            Err(StreamError::ConnectionLost("heartbeat timeout".to_string()))
        );
        assert_eq!(
            b.recv().await,
            Err(StreamError::ConnectionLost("heartbeat timeout".to_string()))
        );

        assert_eq!(table.open("c").unwrap_err(), StreamError::Closed);
    }

    #[tokio::test]
    async fn test_slow_reader_overflows_without_blocking() {
        let config = StreamConfig {
            inbound_capacity: 2,
            outbound_capacity: 4,
        };
        let (table, _peer) = table_with_peer(config);
        let mut session = table.open("stats").unwrap();

        assert_eq!(table.data_in("stats", Bytes::from_static(b"1")), DataOutcome::Delivered);
        assert_eq!(table.data_in("stats", Bytes::from_static(b"2")), DataOutcome::Delivered);
        assert_eq!(table.data_in("stats", Bytes::from_static(b"3")), DataOutcome::Overflow);
        assert!(!table.contains("stats"));

        assert_eq!(session.recv().await.unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(session.recv().await.unwrap(), Some(Bytes::from_static(b"2")));
        assert_eq!(session.recv().await, Err(StreamError::Overflow(2)));
    }

    #[tokio::test]
    async fn test_outbound_chunks_become_ws_data_then_ws_close() {
        let (table, mut peer) = table_with_peer(StreamConfig::default());
        let session = table.open("s7").unwrap();

        session.send(Bytes::from_static(b"one")).await.unwrap();
        session.send(Bytes::from_static(b"two")).await.unwrap();
        session.close(WsClose::normal()).await.unwrap();

        assert_eq!(
            next_envelope(&mut peer).await,
            Envelope::ws_data("s7", Bytes::from_static(b"one"))
        );
        assert_eq!(
            next_envelope(&mut peer).await,
            Envelope::ws_data("s7", Bytes::from_static(b"two"))
        );
        let close = next_envelope(&mut peer).await;
        assert_eq!(close.id, "s7");
        assert!(matches!(close.message, Message::WsClose(_)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!table.contains("s7"));
        assert_eq!(
            session.send(Bytes::from_static(b"late")).await,
            Err(StreamError::Closed)
        );
    }

    #[tokio::test]
    async fn test_dropping_session_closes_towards_peer() {
        let (table, mut peer) = table_with_peer(StreamConfig::default());
        let session = table.open("s8").unwrap();
        drop(session);

        assert_eq!(
            next_envelope(&mut peer).await,
            Envelope::ws_close("s8", WsClose::normal())
        );
    }

    #[tokio::test]
    async fn test_peer_close_stops_writer_without_echo() {
        let (table, mut peer) = table_with_peer(StreamConfig::default());
        let session = table.open("s9").unwrap();

        assert!(table.close("s9"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            session.send(Bytes::from_static(b"x")).await,
            Err(StreamError::Closed)
        );
        drop(session);

        let nothing = tokio::time::timeout(Duration::from_millis(50), peer.source.recv_frame()).await;
        assert!(nothing.is_err(), "no ws_close should be echoed for a peer close");
    }
}
