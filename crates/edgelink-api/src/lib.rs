//! Manager HTTP surface
//!
//! - `GET  /api/tunnel/connect`: agents open their tunnel here (WebSocket)
//! - `ANY  /api/environments/{id}/proxy/{*path}`: proxy a request to an environment
//! - `GET  /api/environments/{id}/ws/{*path}`: proxy a stream (WebSocket)
//! - `GET  /api/environments`: connected environments

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod socket;

use axum::{middleware as axum_middleware, routing::any, routing::get, Router};
use edgelink_auth::CredentialValidator;
use edgelink_control::TunnelRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Path agents dial to open their tunnel
pub const TUNNEL_PATH: &str = "/api/tunnel/connect";

/// Application state shared across handlers
pub struct AppState {
    pub registry: TunnelRegistry,
    /// Deadline for each proxied request
    pub request_timeout: Duration,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server to
    pub bind_addr: SocketAddr,
    pub request_timeout: Duration,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3552)),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
    pairing: Arc<middleware::PairingState>,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        registry: TunnelRegistry,
        validator: Arc<dyn CredentialValidator>,
    ) -> Self {
        let state = Arc::new(AppState {
            registry,
            request_timeout: config.request_timeout,
        });

        Self {
            config,
            state,
            pairing: Arc::new(middleware::PairingState::new(validator)),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        // Agents must pair before they are upgraded
        let tunnel_router = Router::new()
            .route(TUNNEL_PATH, get(handlers::tunnel_connect))
            .route_layer(axum_middleware::from_fn_with_state(
                self.pairing.clone(),
                middleware::require_pairing,
            ))
            .with_state(self.state.clone());

        let api_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/environments", get(handlers::list_environments))
            .route("/api/environments/{id}", get(handlers::get_environment))
            .route(
                "/api/environments/{id}/proxy/{*path}",
                any(handlers::proxy_request),
            )
            .route(
                "/api/environments/{id}/ws/{*path}",
                get(handlers::proxy_stream),
            )
            .with_state(self.state.clone());

        Router::new()
            .merge(tunnel_router)
            .merge(api_router)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let local_addr = listener.local_addr()?;

        info!("Starting API server on {}", local_addr);
        info!("Agents connect to ws://{}{}", local_addr, TUNNEL_PATH);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use edgelink_auth::JwtCredentialValidator;
    use edgelink_control::{ConnectionConfig, MemoryStatusStore};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn server() -> ApiServer {
        let registry = TunnelRegistry::new(
            Arc::new(MemoryStatusStore::new()),
            ConnectionConfig::default(),
        );
        ApiServer::new(
            ApiServerConfig::default(),
            registry,
            Arc::new(JwtCredentialValidator::new(b"secret")),
        )
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = server()
            .build_router()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let health: models::HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.connected_environments, 0);
    }

    #[tokio::test]
    async fn test_tunnel_requires_pairing() {
        let response = server()
            .build_router()
            .oneshot(Request::get(TUNNEL_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_proxy_to_unknown_environment_is_unavailable() {
        let response = server()
            .build_router()
            .oneshot(
                Request::get("/api/environments/nowhere/proxy/containers/json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let error: models::ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("ENVIRONMENT_OFFLINE"));
    }
}
