//! Manager registry and a real agent joined over the in-memory transport

use async_trait::async_trait;
use bytes::Bytes;
use edgelink_agent::{
    Agent, DispatchError, Dispatcher, DispatcherConfig, DuplexChannel, LocalExecutor,
    LocalStreamOpener,
};
use edgelink_connection::{HealthState, ReconnectConfig};
use edgelink_control::{
    CloseReason, ConnectionConfig, EnvironmentStatus, MemoryStatusStore, TunnelError,
    TunnelRegistry,
};
use edgelink_proto::{ProxiedRequest, ProxiedResponse, WsTarget};
use edgelink_transport::memory::{self, MemoryConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

const ENV: &str = "env-1";

/// Stands in for the container engine
struct FakeEngine {
    release: Notify,
}

#[async_trait]
impl LocalExecutor for FakeEngine {
    async fn execute(&self, request: ProxiedRequest) -> Result<ProxiedResponse, DispatchError> {
        match request.path.as_str() {
            "/containers" => Ok(ProxiedResponse::new(200, "[]")),
            "/slow" => {
                self.release.notified().await;
                Ok(ProxiedResponse::new(200, "late"))
            }
            _ => Ok(ProxiedResponse::new(404, "")),
        }
    }
}

struct FakeStreams {
    opened: mpsc::UnboundedSender<DuplexChannel>,
}

#[async_trait]
impl LocalStreamOpener for FakeStreams {
    async fn open(&self, _target: &WsTarget) -> Result<DuplexChannel, DispatchError> {
        let (agent_side, local_side) = DuplexChannel::pair(16);
        let _ = self.opened.send(local_side);
        Ok(agent_side)
    }
}

struct Deployment {
    registry: TunnelRegistry,
    status: Arc<MemoryStatusStore>,
    engine: Arc<FakeEngine>,
    opened: mpsc::UnboundedReceiver<DuplexChannel>,
    agent_shutdown: CancellationToken,
}

/// Start a registry and an agent that dials it through a memory connector
async fn deploy(config: ConnectionConfig) -> Deployment {
    let status = Arc::new(MemoryStatusStore::new());
    let registry = TunnelRegistry::new(status.clone(), config);

    let (connector, mut accepted) = MemoryConnector::new();
    tokio::spawn({
        let registry = registry.clone();
        async move {
            while let Some(end) = accepted.recv().await {
                registry.accept(ENV, end.into_connection("agent")).await;
            }
        }
    });

    let engine = Arc::new(FakeEngine {
        release: Notify::new(),
    });
    let (opened_tx, opened) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(
        engine.clone(),
        Arc::new(FakeStreams { opened: opened_tx }),
        DispatcherConfig::default(),
    );
    let agent = Agent::new(
        Arc::new(connector),
        dispatcher,
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        },
    );

    let agent_shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = agent_shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    wait_for(|| registry.get(ENV).is_some()).await;

    Deployment {
        registry,
        status,
        engine,
        opened,
        agent_shutdown,
    }
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn proxied_request_reaches_engine() {
    let d = deploy(ConnectionConfig::default()).await;

    let response = d
        .registry
        .route_request(
            ENV,
            ProxiedRequest::new("GET", "/containers"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, Bytes::from_static(b"[]"));
    wait_for(|| d.status.get(ENV).map(|r| r.status) == Some(EnvironmentStatus::Online)).await;
}

#[tokio::test]
async fn unknown_environment_fails_fast() {
    let d = deploy(ConnectionConfig::default()).await;

    let result = d
        .registry
        .route_request(
            "env-unknown",
            ProxiedRequest::new("GET", "/containers"),
            Duration::from_secs(5),
        )
        .await;

    assert!(matches!(result, Err(TunnelError::EnvironmentOffline(_))));
}

#[tokio::test]
async fn stream_delivers_chunks_in_order_then_ends() {
    let mut d = deploy(ConnectionConfig::default()).await;

    let mut session = d
        .registry
        .route_stream(ENV, "s1", WsTarget::new("/containers/abc/logs"))
        .await
        .unwrap();
    let local = d.opened.recv().await.unwrap();

    for i in 0..5 {
        local.tx.send(Bytes::from(format!("line {}", i))).await.unwrap();
    }
    drop(local);

    for i in 0..5 {
        let chunk = session.recv().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from(format!("line {}", i)));
    }
    assert_eq!(session.recv().await.unwrap(), None);

    let conn = d.registry.get(ENV).unwrap();
    wait_for(|| conn.stream_count() == 0).await;
}

#[tokio::test]
async fn losing_the_agent_fails_outstanding_work() {
    let mut d = deploy(ConnectionConfig::default()).await;

    let mut requests = Vec::new();
    for _ in 0..3 {
        let registry = d.registry.clone();
        requests.push(tokio::spawn(async move {
            registry
                .route_request(ENV, ProxiedRequest::new("GET", "/slow"), Duration::from_secs(30))
                .await
        }));
    }

    let mut streams = Vec::new();
    let mut locals = Vec::new();
    for i in 0..2 {
        let session = d
            .registry
            .route_stream(ENV, &format!("s{}", i), WsTarget::new("/events"))
            .await
            .unwrap();
        locals.push(d.opened.recv().await.unwrap());
        streams.push(session);
    }

    let conn = d.registry.get(ENV).unwrap();
    wait_for(|| conn.pending_count() == 3).await;

    d.agent_shutdown.cancel();

    for request in requests {
        let result = request.await.unwrap();
        assert!(
            matches!(&result, Err(e) if e.is_connection_error()),
            "unexpected result: {:?}",
            result
        );
    }
    for mut session in streams {
        assert!(!matches!(session.recv().await, Ok(Some(_))));
    }

    wait_for(|| d.registry.get(ENV).is_none()).await;
    wait_for(|| d.status.get(ENV).map(|r| r.status) == Some(EnvironmentStatus::Offline)).await;
    d.engine.release.notify_waiters();
    drop(locals);
}

#[tokio::test]
async fn agent_redials_after_manager_drops_the_tunnel() {
    let d = deploy(ConnectionConfig::default()).await;

    let first = d.registry.get(ENV).unwrap();
    first
        .close(CloseReason::Transport("link reset".to_string()))
        .await;

    wait_for(|| {
        d.registry
            .get(ENV)
            .is_some_and(|conn| conn.connection_id() != first.connection_id())
    })
    .await;

    let response = d
        .registry
        .route_request(
            ENV,
            ProxiedRequest::new("GET", "/containers"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_an_idle_tunnel_online() {
    let d = deploy(ConnectionConfig::default()).await;
    let conn = d.registry.get(ENV).unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;

    let current = d.registry.get(ENV).unwrap();
    assert_eq!(current.connection_id(), conn.connection_id());
    assert_eq!(current.health(), HealthState::Online);
}

#[tokio::test(start_paused = true)]
async fn silent_agent_is_dropped_after_missed_heartbeats() {
    let status = Arc::new(MemoryStatusStore::new());
    let registry = TunnelRegistry::new(status.clone(), ConnectionConfig::default());

    // Reads nothing and answers nothing
    let (manager_end, _silent) = memory::pair(256);
    let conn = registry
        .accept(ENV, manager_end.into_connection("silent"))
        .await;

    // First heartbeat goes out at 10s and is never acknowledged
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(conn.health(), HealthState::Degraded);
    assert!(registry.get(ENV).is_some());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(conn.is_closed());
    assert_eq!(conn.close_reason(), Some(&CloseReason::HeartbeatTimeout));
    wait_for(|| registry.get(ENV).is_none()).await;
    wait_for(|| status.get(ENV).map(|r| r.status) == Some(EnvironmentStatus::Offline)).await;
}
