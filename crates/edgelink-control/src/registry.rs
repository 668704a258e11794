//! Tunnel registry: environment id → live connection
//!
//! At most one connection is registered per environment. Registering a new one
//! swaps the entry atomically and closes the displaced connection, which fails
//! its in-flight calls with a connection error; those calls are never retried
//! on the replacement.

use edgelink_connection::{HealthState, StreamSession};
use edgelink_proto::{ProxiedRequest, ProxiedResponse, WsTarget};
use edgelink_transport::FramedConnection;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::connection::{CloseReason, ConnectionConfig, ConnectionInfo, TunnelConnection};
use crate::status::{EnvironmentStatus, EnvironmentStatusStore};
use crate::TunnelError;

struct Inner {
    connections: RwLock<HashMap<String, Arc<TunnelConnection>>>,
    status: Arc<dyn EnvironmentStatusStore>,
    config: ConnectionConfig,
}

/// Registry of live tunnels, shared by the accept endpoint and request routing
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<Inner>,
}

impl TunnelRegistry {
    pub fn new(status: Arc<dyn EnvironmentStatusStore>, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: RwLock::new(HashMap::new()),
                status,
                config,
            }),
        }
    }

    /// Serve an authenticated transport for `environment_id` and register it
    pub async fn accept(
        &self,
        environment_id: &str,
        connection: FramedConnection,
    ) -> Arc<TunnelConnection> {
        let conn = TunnelConnection::spawn(environment_id, connection, self.inner.config.clone());
        self.register(conn.clone()).await;
        conn
    }

    /// Register a connection, replacing (and closing) any previous one.
    ///
    /// Returns the displaced connection.
    pub async fn register(&self, conn: Arc<TunnelConnection>) -> Option<Arc<TunnelConnection>> {
        let environment_id = conn.environment_id().to_string();

        let previous = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(environment_id.clone(), conn.clone());

        self.watch(conn.clone());

        match previous {
            Some(old) if !Arc::ptr_eq(&old, &conn) => {
                info!(
                    environment_id = %environment_id,
                    old_connection_id = %old.connection_id(),
                    new_connection_id = %conn.connection_id(),
                    "Re-registered environment (replaced existing connection)"
                );
                old.close(CloseReason::Replaced).await;
                Some(old)
            }
            Some(_) => None,
            None => {
                info!(
                    environment_id = %environment_id,
                    connection_id = %conn.connection_id(),
                    "Registered new environment connection"
                );
                None
            }
        }
    }

    /// Remove the entry for `environment_id` only if it is still
    /// `connection_id`
    pub fn unregister(&self, environment_id: &str, connection_id: &str) -> bool {
        let mut connections = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let is_current = connections
            .get(environment_id)
            .is_some_and(|current| current.connection_id() == connection_id);

        if is_current {
            connections.remove(environment_id);
            info!(environment_id = %environment_id, "Unregistered environment");
        } else {
            debug!(
                environment_id = %environment_id,
                connection_id = %connection_id,
                "Connection no longer registered, nothing to remove"
            );
        }
        is_current
    }

    pub fn get(&self, environment_id: &str) -> Option<Arc<TunnelConnection>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(environment_id)
            .cloned()
    }

    /// List all registered connections, ordered by environment id
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|conn| conn.info())
            .collect();
        infos.sort_by(|a, b| a.environment_id.cmp(&b.environment_id));
        infos
    }

    pub fn count(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Proxy one request to the environment's agent.
    ///
    /// Fails immediately with [`TunnelError::EnvironmentOffline`] when the
    /// environment has no routable connection.
    pub async fn route_request(
        &self,
        environment_id: &str,
        request: ProxiedRequest,
        timeout: Duration,
    ) -> Result<ProxiedResponse, TunnelError> {
        let conn = self.routable(environment_id)?;
        conn.request(request, timeout).await
    }

    /// Open a proxied stream to the environment's agent
    pub async fn route_stream(
        &self,
        environment_id: &str,
        stream_id: &str,
        target: WsTarget,
    ) -> Result<StreamSession, TunnelError> {
        let conn = self.routable(environment_id)?;
        conn.open_stream(stream_id, target).await
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<TunnelConnection>> = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        for conn in connections {
            conn.close(CloseReason::Shutdown).await;
            self.inner
                .status
                .set_status(
                    conn.environment_id(),
                    EnvironmentStatus::Offline,
                    conn.last_seen(),
                )
                .await;
        }
    }

    fn routable(&self, environment_id: &str) -> Result<Arc<TunnelConnection>, TunnelError> {
        self.get(environment_id)
            .filter(|conn| conn.health().is_routable())
            .ok_or_else(|| TunnelError::EnvironmentOffline(environment_id.to_string()))
    }

    /// Report the connection's reachability and freshness, and unregister it
    /// once it closes
    fn watch(&self, conn: Arc<TunnelConnection>) {
        let registry = self.clone();

        tokio::spawn(async move {
            let environment_id = conn.environment_id().to_string();
            let status = registry.inner.status.clone();
            let mut health = conn.subscribe_health();
            let mut seen = conn.subscribe_last_seen();
            let mut reported = None;

            loop {
                let state = *health.borrow_and_update();
                if state == HealthState::Closed {
                    break;
                }
                if state.is_routable() && reported != Some(EnvironmentStatus::Online) {
                    status
                        .set_status(&environment_id, EnvironmentStatus::Online, conn.last_seen())
                        .await;
                    reported = Some(EnvironmentStatus::Online);
                }
                tokio::select! {
                    changed = health.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = seen.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let last_seen = *seen.borrow_and_update();
                        if conn.health().is_routable() {
                            status
                                .set_status(&environment_id, EnvironmentStatus::Online, last_seen)
                                .await;
                        }
                    }
                }
            }

            if registry.unregister(&environment_id, conn.connection_id()) {
                status
                    .set_status(&environment_id, EnvironmentStatus::Offline, conn.last_seen())
                    .await;

                // A replacement may have registered while we were reporting
                if let Some(current) = registry.get(&environment_id) {
                    if current.health().is_routable() {
                        status
                            .set_status(
                                &environment_id,
                                EnvironmentStatus::Online,
                                current.last_seen(),
                            )
                            .await;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("connections", &self.count())
            .finish()
    }
}
