//! Agent configuration

use edgelink_connection::{ReconnectConfig, StreamConfig};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::dispatcher::DispatcherConfig;
use crate::AgentError;

/// Everything an agent needs to pair with its manager and reach local services
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentConfig {
    /// Manager tunnel endpoint (ws:// or wss://)
    pub manager_url: String,

    pub environment_id: String,

    /// Pairing token issued by the manager
    pub token: String,

    /// Local HTTP endpoint requests are executed against (host:port)
    #[serde(default = "default_local_http")]
    pub local_http: String,

    /// Base URL for local streams; `ws://<local_http>` when unset
    #[serde(default)]
    pub local_ws: Option<String>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Drop the link after this long without a heartbeat
    #[serde(default = "default_idle_timeout", with = "edgelink_connection::duration_secs")]
    pub idle_timeout: Duration,

    #[serde(default = "default_connect_timeout", with = "edgelink_connection::duration_secs")]
    pub connect_timeout: Duration,

    #[serde(default)]
    pub streams: StreamConfig,
}

fn default_local_http() -> String {
    "127.0.0.1:2375".to_string()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(45)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl AgentConfig {
    pub fn new(
        manager_url: impl Into<String>,
        environment_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            manager_url: manager_url.into(),
            environment_id: environment_id.into(),
            token: token.into(),
            local_http: default_local_http(),
            local_ws: None,
            reconnect: ReconnectConfig::default(),
            idle_timeout: default_idle_timeout(),
            connect_timeout: default_connect_timeout(),
            streams: StreamConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.environment_id.trim().is_empty() {
            return Err(AgentError::InvalidConfig("environment id is required".into()));
        }
        if self.token.trim().is_empty() {
            return Err(AgentError::InvalidConfig("pairing token is required".into()));
        }
        self.manager_url()?;
        self.local_ws_url()?;
        let valid_local = match self.local_http.rsplit_once(':') {
            Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
            None => false,
        };
        if !valid_local {
            return Err(AgentError::InvalidConfig(format!(
                "invalid local HTTP address '{}' (expected host:port)",
                self.local_http
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(AgentError::InvalidConfig("idle_timeout must be greater than zero".into()));
        }
        self.reconnect.validate().map_err(AgentError::InvalidConfig)
    }

    pub fn manager_url(&self) -> Result<Url, AgentError> {
        let url = Url::parse(&self.manager_url).map_err(|e| {
            AgentError::InvalidConfig(format!("invalid manager url '{}': {}", self.manager_url, e))
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(AgentError::InvalidConfig(format!(
                "manager url must use ws:// or wss://, got {}://",
                other
            ))),
        }
    }

    pub fn local_ws_url(&self) -> Result<Url, AgentError> {
        let raw = match &self.local_ws {
            Some(url) => url.clone(),
            None => format!("ws://{}", self.local_http),
        };
        Url::parse(&raw)
            .map_err(|e| AgentError::InvalidConfig(format!("invalid local stream url '{}': {}", raw, e)))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            idle_timeout: self.idle_timeout,
            streams: self.streams.clone(),
        }
    }
}
