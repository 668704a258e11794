//! Agent lifecycle: dial, serve, back off, redial

use edgelink_connection::{Backoff, ReconnectConfig};
use edgelink_transport::{ConnectError, Connector, WebSocketConnector};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::dispatcher::{Dispatcher, SessionEnd};
use crate::executor::HttpExecutor;
use crate::local_stream::WebSocketStreamOpener;
use crate::AgentError;

/// Link state as seen by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    /// Dialing the manager and presenting the pairing credential
    Authenticating,
    Connected,
}

/// Keeps one tunnel to the manager alive for as long as it runs
pub struct Agent {
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    reconnect: ReconnectConfig,
    state: watch::Sender<AgentState>,
}

impl Agent {
    pub fn new(
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Disconnected);
        Self {
            connector,
            dispatcher,
            reconnect,
            state,
        }
    }

    /// Build an agent that dials over WebSocket and serves local HTTP and
    /// WebSocket endpoints
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;

        let connector = WebSocketConnector::new(
            config.manager_url()?,
            config.environment_id.clone(),
            config.token.clone(),
        )
        .with_connect_timeout(config.connect_timeout);

        let dispatcher = Dispatcher::new(
            Arc::new(HttpExecutor::new(config.local_http.clone())),
            Arc::new(WebSocketStreamOpener::new(config.local_ws_url()?)),
            config.dispatcher_config(),
        );

        Ok(Self::new(
            Arc::new(connector),
            dispatcher,
            config.reconnect.clone(),
        ))
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` fires, reconnecting with backoff whenever the link
    /// fails or the manager rejects the dial
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(self.reconnect.clone());

        while !shutdown.is_cancelled() {
            self.state.send_replace(AgentState::Authenticating);

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(connection) => {
                    info!(peer = %connection.peer, "✅ Connected to manager");
                    backoff.reset();
                    self.state.send_replace(AgentState::Connected);

                    let end = self.dispatcher.run(connection, &shutdown).await;
                    self.state.send_replace(AgentState::Disconnected);
                    if end == SessionEnd::Shutdown {
                        break;
                    }
                    info!("Disconnected from manager ({}), reconnecting", end);
                }
                Err(ConnectError::Unauthorized(reason)) => {
                    self.state.send_replace(AgentState::Disconnected);
                    error!(
                        attempt = backoff.attempt() + 1,
                        "Manager rejected the pairing credential: {}", reason
                    );
                }
                Err(e) => {
                    self.state.send_replace(AgentState::Disconnected);
                    warn!(
                        attempt = backoff.attempt() + 1,
                        "Failed to connect to manager: {}", e
                    );
                }
            }

            if !backoff.wait(&shutdown).await {
                break;
            }
        }

        self.state.send_replace(AgentState::Disconnected);
        info!("Agent stopped");
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("state", &self.state())
            .field("reconnect", &self.reconnect)
            .finish()
    }
}
