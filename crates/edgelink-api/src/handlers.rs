//! API request handlers

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, RawQuery, State, WebSocketUpgrade,
    },
    http::{HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use edgelink_connection::StreamSession;
use edgelink_control::{EnvironmentStatus, TunnelError};
use edgelink_proto::{ProxiedRequest, ProxiedResponse, WsClose, WsTarget, MAX_FRAME_SIZE};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::middleware::PairedAgent;
use crate::models::{EnvironmentList, EnvironmentSummary, ErrorResponse, HealthResponse};
use crate::socket;
use crate::AppState;

/// Headers that describe a single hop and are not proxied
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "host",
    "content-length",
];

fn is_forwardable(name: &HeaderName) -> bool {
    !HOP_BY_HOP.contains(&name.as_str())
}

/// Health check
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_environments: state.registry.count(),
    })
}

/// List connected environments
pub async fn list_environments(State(state): State<Arc<AppState>>) -> Json<EnvironmentList> {
    debug!("Listing environments");

    let environments = state.registry.list();
    Json(EnvironmentList {
        total: environments.len(),
        environments,
    })
}

/// Reachability of one environment
pub async fn get_environment(
    State(state): State<Arc<AppState>>,
    Path(environment_id): Path<String>,
) -> Json<EnvironmentSummary> {
    let connection = state.registry.get(&environment_id).map(|conn| conn.info());
    let status = match &connection {
        Some(info) if info.state.is_routable() => EnvironmentStatus::Online,
        _ => EnvironmentStatus::Offline,
    };

    Json(EnvironmentSummary {
        environment_id,
        status,
        connection,
    })
}

/// Accept a tunnel from an authenticated agent
pub async fn tunnel_connect(
    State(state): State<Arc<AppState>>,
    Extension(agent): Extension<PairedAgent>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            let connection = socket::into_connection(socket, agent.peer.clone());
            let conn = state
                .registry
                .accept(&agent.environment_id, connection)
                .await;
            info!(
                environment_id = %agent.environment_id,
                connection_id = %conn.connection_id(),
                peer = %agent.peer,
                "✅ Agent connected"
            );
        })
}

/// Proxy one HTTP request to the environment's agent
pub async fn proxy_request(
    State(state): State<Arc<AppState>>,
    Path((environment_id, path)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut target = format!("/{}", path.trim_start_matches('/'));
    if let Some(query) = query {
        target.push('?');
        target.push_str(&query);
    }

    let mut request = ProxiedRequest::new(method.as_str(), target).with_body(body);
    for (name, value) in headers.iter().filter(|(name, _)| is_forwardable(name)) {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    debug!(
        environment_id = %environment_id,
        method = %request.method,
        path = %request.path,
        "Proxying request"
    );

    match state
        .registry
        .route_request(&environment_id, request, state.request_timeout)
        .await
    {
        Ok(response) => into_http_response(response),
        Err(e) => tunnel_error_response(&environment_id, e),
    }
}

/// Open a proxied stream to the environment's agent and bridge it to the
/// caller's WebSocket
pub async fn proxy_stream(
    State(state): State<Arc<AppState>>,
    Path((environment_id, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let mut target = WsTarget::new(format!("/{}", path.trim_start_matches('/')));
    if let Some(query) = query {
        target = target.with_query(query);
    }

    let stream_id = Uuid::new_v4().to_string();
    match state
        .registry
        .route_stream(&environment_id, &stream_id, target)
        .await
    {
        Ok(session) => {
            debug!(environment_id = %environment_id, stream_id = %stream_id, "Stream opened");
            ws.on_upgrade(move |socket| bridge_client(socket, session))
        }
        Err(e) => tunnel_error_response(&environment_id, e),
    }
}

async fn bridge_client(socket: WebSocket, session: StreamSession) {
    let (mut client_tx, mut client_rx) = socket.split();
    let (mut reader, writer) = session.split();

    // Agent → caller
    let downstream = async move {
        let close = loop {
            match reader.recv().await {
                Ok(Some(chunk)) => {
                    let message = match std::str::from_utf8(&chunk) {
                        Ok(text) => Message::Text(text.into()),
                        Err(_) => Message::Binary(chunk),
                    };
                    if client_tx.send(message).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    break CloseFrame {
                        code: 1000,
                        reason: "".into(),
                    }
                }
                Err(e) => {
                    break CloseFrame {
                        code: 1011,
                        reason: e.to_string().into(),
                    }
                }
            }
        };
        let _ = client_tx.send(Message::Close(Some(close))).await;
    };

    // Caller → agent
    let upstream = async move {
        while let Some(Ok(message)) = client_rx.next().await {
            let chunk = match message {
                Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Message::Binary(data) => data,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if writer.send(chunk).await.is_err() {
                return;
            }
        }
        let _ = writer.close(WsClose::normal()).await;
    };

    tokio::select! {
        _ = downstream => {}
        _ = upstream => {}
    }
}

fn into_http_response(response: ProxiedResponse) -> Response {
    let status = match StatusCode::from_u16(response.status) {
        Ok(status) => status,
        Err(_) => {
            warn!("Agent returned invalid status {}", response.status);
            return (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new("Agent returned an invalid status", "BAD_STATUS")),
            )
                .into_response();
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder.body(Body::from(response.body)).unwrap_or_else(|e| {
        warn!("Agent returned an unusable response: {}", e);
        (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse::new("Agent returned invalid headers", "BAD_HEADERS")),
        )
            .into_response()
    })
}

/// Map a routing failure to an HTTP error
pub fn tunnel_error_response(environment_id: &str, error: TunnelError) -> Response {
    let (status, code) = match &error {
        TunnelError::EnvironmentOffline(_) => (StatusCode::SERVICE_UNAVAILABLE, "ENVIRONMENT_OFFLINE"),
        TunnelError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
        TunnelError::ConnectionClosed | TunnelError::ConnectionLost(_) => {
            (StatusCode::BAD_GATEWAY, "CONNECTION_LOST")
        }
        TunnelError::Remote { .. } => (StatusCode::BAD_GATEWAY, "AGENT_ERROR"),
        TunnelError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        TunnelError::DuplicateId(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DUPLICATE_ID"),
    };

    debug!(environment_id = %environment_id, status = %status, "Routing failed: {}", error);
    (status, Json(ErrorResponse::new(error.to_string(), code))).into_response()
}
