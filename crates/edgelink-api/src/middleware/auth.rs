//! Agent pairing middleware
//!
//! Guards the tunnel endpoint. The agent presents its pairing token as
//! `Authorization: Bearer <token>` and names its environment in
//! `X-Environment-Id`; both are checked before the WebSocket upgrade so a
//! rejected agent sees a plain 401.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use edgelink_auth::CredentialValidator;
use edgelink_proto::ENVIRONMENT_ID_HEADER;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::ErrorResponse;

/// Authenticated agent, available to handlers as an extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedAgent {
    pub environment_id: String,
    /// Remote address when known
    pub peer: String,
}

/// Validator shared across middleware instances
#[derive(Clone)]
pub struct PairingState {
    pub validator: Arc<dyn CredentialValidator>,
}

impl PairingState {
    pub fn new(validator: Arc<dyn CredentialValidator>) -> Self {
        Self { validator }
    }
}

type Rejection = (StatusCode, Json<ErrorResponse>);

fn unauthorized(error: impl Into<String>, code: &str) -> Rejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(error, code)),
    )
}

/// Authenticate an agent opening a tunnel
///
/// # Errors
/// Returns 401 Unauthorized if:
/// - The Authorization header is missing or not a Bearer token
/// - The environment id header is missing
/// - The validator rejects the token for that environment
pub async fn require_pairing(
    State(state): State<Arc<PairingState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, Rejection> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized("Missing Authorization header", "MISSING_AUTH"))?
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            unauthorized(
                "Invalid Authorization header format. Expected 'Bearer <token>'",
                "INVALID_AUTH_FORMAT",
            )
        })?
        .trim()
        .to_string();

    let environment_id = request
        .headers()
        .get(ENVIRONMENT_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| unauthorized("Missing environment id header", "MISSING_ENVIRONMENT"))?
        .to_string();

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if let Err(e) = state.validator.validate(&environment_id, &token).await {
        warn!(
            environment_id = %environment_id,
            peer = %peer,
            "Rejected agent pairing: {}",
            e
        );
        return Err(unauthorized(
            format!("Invalid pairing credential: {}", e),
            "INVALID_TOKEN",
        ));
    }

    debug!(environment_id = %environment_id, peer = %peer, "Agent authenticated");
    request.extensions_mut().insert(PairedAgent {
        environment_id,
        peer,
    });

    Ok(next.run(request).await)
}
