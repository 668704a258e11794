//! Local request execution
//!
//! [`HttpExecutor`] forwards proxied requests to a local HTTP endpoint (for
//! example a Docker API exposed over TCP) using hyper with a small pool of
//! keep-alive connections.

use async_trait::async_trait;
use bytes::Bytes;
use edgelink_proto::{ProxiedRequest, ProxiedResponse};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::DispatchError;

/// Maximum number of pooled connections to the local endpoint
const MAX_POOL_SIZE: usize = 10;

/// Headers that describe a single hop and are not forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Executes a proxied request against something local to the agent
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn execute(&self, request: ProxiedRequest) -> Result<ProxiedResponse, DispatchError>;
}

/// Executes requests against a local HTTP/1.1 endpoint
pub struct HttpExecutor {
    /// Target address (host:port)
    target: String,
    pool: Mutex<Vec<http1::SendRequest<Full<Bytes>>>>,
}

impl HttpExecutor {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            pool: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get or create a connection to the target
    async fn get_connection(&self) -> Result<http1::SendRequest<Full<Bytes>>, DispatchError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                if sender.is_ready() {
                    debug!("Reusing pooled connection to {}", self.target);
                    return Ok(sender);
                }
            }
        }

        debug!("Creating new connection to {}", self.target);
        let stream = TcpStream::connect(&self.target).await.map_err(|e| {
            DispatchError::Unavailable(format!("failed to connect to {}: {}", self.target, e))
        })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| DispatchError::Unavailable(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Local connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    async fn return_connection(&self, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            return;
        }

        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
        }
    }

    fn build_request(&self, request: ProxiedRequest) -> Result<Request<Full<Bytes>>, DispatchError> {
        let mut builder = Request::builder()
            .method(request.method.as_str())
            .uri(request.path.as_str());

        let mut has_host = false;
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            has_host |= name.eq_ignore_ascii_case(HOST.as_str());
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_host {
            builder = builder.header(HOST, self.target.as_str());
        }

        builder
            .body(Full::new(request.body))
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))
    }
}

#[async_trait]
impl LocalExecutor for HttpExecutor {
    async fn execute(&self, request: ProxiedRequest) -> Result<ProxiedResponse, DispatchError> {
        let request = self.build_request(request)?;
        let mut sender = self.get_connection().await?;

        sender
            .ready()
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| DispatchError::Failed(format!("request failed: {}", e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| {
                !is_hop_by_hop(name.as_str()) && !name.as_str().eq_ignore_ascii_case("content-length")
            })
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DispatchError::Failed(format!("failed to read response body: {}", e)))?
            .to_bytes();

        self.return_connection(sender).await;

        Ok(ProxiedResponse {
            status,
            headers,
            body,
        })
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}
