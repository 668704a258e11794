//! Outbound dialing for agents

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite;
use tracing::debug;
use url::Url;

use edgelink_proto::{ENVIRONMENT_ID_HEADER, PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER};

use crate::websocket;
use crate::{FrameSink, FrameSource};

/// Dial failures, split so the caller can tell a rejected credential from a
/// network problem
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Credential rejected: {0}")]
    Unauthorized(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
}

/// An established, authenticated duplex frame channel
pub struct FramedConnection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    /// Human readable peer description for logs
    pub peer: String,
}

impl std::fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("peer", &self.peer)
            .finish()
    }
}

/// Something that can produce a fresh authenticated connection to the manager
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<FramedConnection, ConnectError>;
}

/// Dials the manager's tunnel endpoint over WebSocket (ws:// or wss://),
/// presenting the pairing credential on the upgrade request
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    environment_id: String,
    token: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: Url, environment_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url,
            environment_id: environment_id.into(),
            token: token.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn build_request(
        &self,
    ) -> Result<tungstenite::handshake::client::Request, ConnectError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Dial(format!("invalid manager url: {}", e)))?;

        let headers = request.headers_mut();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| ConnectError::Unauthorized("token is not a valid header value".into()))?;
        headers.insert(header::AUTHORIZATION, bearer);

        let environment = HeaderValue::from_str(&self.environment_id)
            .map_err(|_| ConnectError::Dial("environment id is not a valid header value".into()))?;
        headers.insert(ENVIRONMENT_ID_HEADER, environment);
        headers.insert(
            PROTOCOL_VERSION_HEADER,
            HeaderValue::from(PROTOCOL_VERSION),
        );

        Ok(request)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<FramedConnection, ConnectError> {
        let request = self.build_request()?;

        debug!(url = %self.url, environment_id = %self.environment_id, "Dialing manager");

        let handshake = tokio_tungstenite::connect_async(request);
        let (ws, _response) = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Err(_) => return Err(ConnectError::Timeout(self.connect_timeout)),
            Ok(Err(tungstenite::Error::Http(response)))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                return Err(ConnectError::Unauthorized(format!(
                    "manager answered {}",
                    response.status()
                )));
            }
            Ok(Err(e)) => return Err(ConnectError::Dial(e.to_string())),
            Ok(Ok(established)) => established,
        };

        let (sink, source) = websocket::split(ws);
        Ok(FramedConnection {
            sink: Box::new(sink),
            source: Box::new(source),
            peer: self.url.to_string(),
        })
    }
}
