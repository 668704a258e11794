//! Dispatcher behaviour over an in-memory tunnel

use async_trait::async_trait;
use bytes::Bytes;
use edgelink_agent::{
    DispatchError, Dispatcher, DispatcherConfig, DuplexChannel, LocalExecutor, LocalStreamOpener,
    SessionEnd,
};
use edgelink_proto::{
    Envelope, EnvelopeCodec, Message, ProxiedRequest, ProxiedResponse, ResponsePayload, WsClose,
    WsTarget,
};
use edgelink_transport::memory::{self, MemoryEnd};
use edgelink_transport::{FrameSink, FrameSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Answers `/containers` with `[]`, fails `/broken`, blocks on `/slow`
struct FakeDocker {
    release: Notify,
}

#[async_trait]
impl LocalExecutor for FakeDocker {
    async fn execute(&self, request: ProxiedRequest) -> Result<ProxiedResponse, DispatchError> {
        match request.path.as_str() {
            "/containers" => Ok(ProxiedResponse::new(200, "[]").with_header("content-type", "application/json")),
            "/broken" => Err(DispatchError::Unavailable("docker is down".into())),
            "/slow" => {
                self.release.notified().await;
                Ok(ProxiedResponse::new(200, "slow"))
            }
            _ => Ok(ProxiedResponse::new(404, "")),
        }
    }
}

/// Hands the local end of every opened stream to the test
struct FakeStreams {
    opened: mpsc::UnboundedSender<(WsTarget, DuplexChannel)>,
}

#[async_trait]
impl LocalStreamOpener for FakeStreams {
    async fn open(&self, target: &WsTarget) -> Result<DuplexChannel, DispatchError> {
        if target.path == "/missing" {
            return Err(DispatchError::Unavailable("no such endpoint".into()));
        }
        let (agent_side, local_side) = DuplexChannel::pair(16);
        let _ = self.opened.send((target.clone(), local_side));
        Ok(agent_side)
    }
}

struct Harness {
    manager: MemoryEnd,
    executor: Arc<FakeDocker>,
    opened: mpsc::UnboundedReceiver<(WsTarget, DuplexChannel)>,
    shutdown: CancellationToken,
    session: JoinHandle<SessionEnd>,
}

impl Harness {
    fn start(config: DispatcherConfig) -> Self {
        Self::start_with_capacity(config, 64)
    }

    /// `capacity` frames fit in each direction before writes block
    fn start_with_capacity(config: DispatcherConfig, capacity: usize) -> Self {
        let (manager, agent) = memory::pair(capacity);
        let executor = Arc::new(FakeDocker {
            release: Notify::new(),
        });
        let (opened_tx, opened) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            executor.clone(),
            Arc::new(FakeStreams { opened: opened_tx }),
            config,
        );

        let shutdown = CancellationToken::new();
        let session = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                dispatcher
                    .run(agent.into_connection("memory"), &shutdown)
                    .await
            }
        });

        Self {
            manager,
            executor,
            opened,
            shutdown,
            session,
        }
    }

    async fn send(&mut self, envelope: Envelope) {
        let frame = EnvelopeCodec::encode(&envelope).unwrap();
        self.manager.sink.send_frame(frame).await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(120), self.manager.source.recv_frame())
            .await
            .expect("no frame from agent")
            .unwrap()
            .expect("agent closed the link");
        EnvelopeCodec::decode(&frame).unwrap()
    }
}

#[tokio::test]
async fn request_gets_response_with_same_id() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::request("r1", ProxiedRequest::new("GET", "/containers")))
        .await;

    let reply = h.recv().await;
    assert_eq!(reply.id, "r1");
    match reply.message {
        Message::Response(ResponsePayload::Success(response)) => {
            assert_eq!(response.status, 200);
            assert_eq!(response.body, Bytes::from_static(b"[]"));
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn execution_failure_becomes_error_descriptor() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::request("r2", ProxiedRequest::new("GET", "/broken")))
        .await;

    let reply = h.recv().await;
    assert_eq!(reply.id, "r2");
    match reply.message {
        Message::Response(ResponsePayload::Failure { error }) => {
            assert_eq!(error.code, "unavailable");
            assert!(error.message.contains("docker is down"));
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn heartbeat_is_not_queued_behind_slow_work() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::request("slow", ProxiedRequest::new("GET", "/slow")))
        .await;
    h.send(Envelope::heartbeat("hb-1")).await;

    assert_eq!(h.recv().await, Envelope::heartbeat_ack("hb-1"));

    h.executor.release.notify_one();
    assert_eq!(h.recv().await.id, "slow");
}

#[tokio::test]
async fn responses_complete_out_of_order() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::request("a", ProxiedRequest::new("GET", "/slow")))
        .await;
    h.send(Envelope::request("b", ProxiedRequest::new("GET", "/containers")))
        .await;

    assert_eq!(h.recv().await.id, "b");
    h.executor.release.notify_one();
    assert_eq!(h.recv().await.id, "a");
}

#[tokio::test]
async fn stream_pumps_both_directions() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::ws_start(
        "s1",
        WsTarget::new("/containers/abc/logs").with_query("follow=1"),
    ))
    .await;
    let (target, mut local) = h.opened.recv().await.unwrap();
    assert_eq!(target.path, "/containers/abc/logs");
    assert_eq!(target.query.as_deref(), Some("follow=1"));

    // manager → local, in order
    for chunk in ["one", "two", "three"] {
        h.send(Envelope::ws_data("s1", Bytes::from(chunk))).await;
    }
    for chunk in ["one", "two", "three"] {
        assert_eq!(local.rx.recv().await, Some(Bytes::from(chunk)));
    }

    // local → manager
    local.tx.send(Bytes::from_static(b"log line")).await.unwrap();
    assert_eq!(
        h.recv().await,
        Envelope::ws_data("s1", Bytes::from_static(b"log line"))
    );

    // local EOF → ws_close
    drop(local.tx);
    let close = h.recv().await;
    assert_eq!(close.id, "s1");
    assert!(matches!(close.message, Message::WsClose(_)));
}

#[tokio::test]
async fn manager_close_closes_local_stream() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::ws_start("s2", WsTarget::new("/events"))).await;
    let (_, mut local) = h.opened.recv().await.unwrap();

    h.send(Envelope::ws_data("s2", Bytes::from_static(b"last")))
        .await;
    h.send(Envelope::ws_close("s2", WsClose::normal())).await;

    assert_eq!(local.rx.recv().await, Some(Bytes::from_static(b"last")));
    assert_eq!(local.rx.recv().await, None);
}

#[tokio::test]
async fn failed_local_open_closes_stream() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::ws_start("s3", WsTarget::new("/missing"))).await;

    let reply = h.recv().await;
    assert_eq!(reply.id, "s3");
    match reply.message {
        Message::WsClose(close) => {
            assert_eq!(close.code, Some(1011));
            assert!(close.reason.unwrap_or_default().contains("no such endpoint"));
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn unexpected_and_malformed_frames_are_dropped() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::heartbeat_ack("stray")).await;
    h.send(Envelope::response("nobody", ProxiedResponse::new(200, "")))
        .await;
    h.manager
        .sink
        .send_frame("{not json".to_string())
        .await
        .unwrap();
    h.send(Envelope::ws_data("unknown-stream", Bytes::from_static(b"x")))
        .await;

    // The link is still served
    h.send(Envelope::heartbeat("hb-2")).await;
    assert_eq!(h.recv().await, Envelope::heartbeat_ack("hb-2"));
}

#[tokio::test]
async fn manager_disconnect_ends_session_and_streams() {
    let mut h = Harness::start(DispatcherConfig::default());

    h.send(Envelope::ws_start("s4", WsTarget::new("/stats"))).await;
    let (_, mut local) = h.opened.recv().await.unwrap();

    let Harness { manager, session, .. } = h;
    drop(manager);

    assert_eq!(session.await.unwrap(), SessionEnd::PeerClosed);
    assert_eq!(local.rx.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn silent_manager_hits_idle_timeout() {
    let config = DispatcherConfig {
        idle_timeout: Duration::from_secs(45),
        ..Default::default()
    };
    let mut h = Harness::start(config);

    // Heartbeats keep the session alive
    for i in 0..3 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        h.send(Envelope::heartbeat(format!("hb-{}", i))).await;
        assert_eq!(h.recv().await.id, format!("hb-{}", i));
    }

    // Then silence
    let end = h.session.await.unwrap();
    assert_eq!(end, SessionEnd::IdleTimeout);
}

#[tokio::test(start_paused = true)]
async fn manager_that_stops_reading_hits_idle_timeout() {
    let config = DispatcherConfig {
        idle_timeout: Duration::from_secs(45),
        ..Default::default()
    };
    let mut h = Harness::start_with_capacity(config, 1);
    let started = tokio::time::Instant::now();

    // The first ack fills the link, the second can never be written
    h.send(Envelope::heartbeat("hb-0")).await;
    h.send(Envelope::heartbeat("hb-1")).await;

    let end = tokio::time::timeout(Duration::from_secs(120), h.session)
        .await
        .expect("session stuck on a blocked ack")
        .unwrap();
    assert_eq!(end, SessionEnd::IdleTimeout);
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test]
async fn shutdown_stops_session() {
    let h = Harness::start(DispatcherConfig::default());
    h.shutdown.cancel();
    assert_eq!(h.session.await.unwrap(), SessionEnd::Shutdown);
}
