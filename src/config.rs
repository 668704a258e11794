//! Configuration for the `edgelink` binary
//!
//! The manager is configured from flags and environment variables. The agent
//! can also read a YAML file; flags given on the command line override it.

use anyhow::{Context, Result};
use edgelink_agent::AgentConfig;
use edgelink_api::ApiServerConfig;
use edgelink_connection::{HeartbeatConfig, StreamConfig};
use edgelink_control::ConnectionConfig;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub bind_addr: SocketAddr,
    /// HS256 secret pairing tokens are signed with
    pub jwt_secret: String,
    pub request_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub streams: StreamConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3552)),
            jwt_secret: String::new(),
            request_timeout: Duration::from_secs(30),
            heartbeat: HeartbeatConfig::default(),
            streams: StreamConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.len() < 16 {
            anyhow::bail!("JWT secret must be at least 16 characters (use --jwt-secret or EDGELINK_JWT_SECRET)");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("Request timeout must be greater than zero");
        }
        self.heartbeat
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid heartbeat settings: {}", e))?;
        Ok(())
    }

    pub fn api_config(&self) -> ApiServerConfig {
        ApiServerConfig {
            bind_addr: self.bind_addr,
            request_timeout: self.request_timeout,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat: self.heartbeat.clone(),
            streams: self.streams.clone(),
        }
    }
}

/// Agent values given on the command line
#[derive(Debug, Default, Clone)]
pub struct AgentOverrides {
    pub manager_url: Option<String>,
    pub environment_id: Option<String>,
    pub token: Option<String>,
    pub local_http: Option<String>,
    pub local_ws: Option<String>,
}

/// Load the agent's YAML file (if any) and apply command line overrides
///
/// The file uses the same keys as [`AgentConfig`], plus `token_env` to read
/// the pairing token from an environment variable.
pub fn build_agent_config(file: Option<&Path>, overrides: AgentOverrides) -> Result<AgentConfig> {
    let mut doc = match file {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => Mapping::new(),
    };

    if let Some(Value::String(var)) = doc.remove("token_env") {
        if doc.get("token").is_none() && overrides.token.is_none() {
            let token = std::env::var(&var)
                .with_context(|| format!("Environment variable {} not set", var))?;
            doc.insert("token".into(), Value::String(token));
        }
    }

    let fields = [
        ("manager_url", overrides.manager_url),
        ("environment_id", overrides.environment_id),
        ("token", overrides.token),
        ("local_http", overrides.local_http),
        ("local_ws", overrides.local_ws),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            doc.insert(key.into(), Value::String(value));
        }
    }

    if doc.get("manager_url").is_none() {
        anyhow::bail!("Manager URL is required (use --manager-url or config file)");
    }
    if doc.get("environment_id").is_none() {
        anyhow::bail!("Environment id is required (use --environment-id or config file)");
    }
    if doc.get("token").is_none() {
        anyhow::bail!(
            "Pairing token is required (use --token, environment variable, or config file)"
        );
    }

    let config: AgentConfig =
        serde_yaml::from_value(Value::Mapping(doc)).context("Invalid agent configuration")?;
    config.validate()?;

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Mapping> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    match serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => anyhow::bail!("Config file {} must be a YAML mapping", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("edgelink-{}-{}.yaml", name, std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_cli_only() {
        let config = build_agent_config(
            None,
            AgentOverrides {
                manager_url: Some("ws://127.0.0.1:3552/api/tunnel/connect".into()),
                environment_id: Some("env-1".into()),
                token: Some("token".into()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.environment_id, "env-1");
        assert_eq!(config.local_http, "127.0.0.1:2375");
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = write_config(
            "override",
            r#"
manager_url: ws://file-manager:3552/api/tunnel/connect
environment_id: from-file
token: file-token
local_http: 127.0.0.1:8080
idle_timeout: 30
"#,
        );

        let config = build_agent_config(
            Some(&path),
            AgentOverrides {
                environment_id: Some("from-cli".into()),
                ..Default::default()
            },
        )
        .unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.manager_url, "ws://file-manager:3552/api/tunnel/connect");
        assert_eq!(config.environment_id, "from-cli");
        assert_eq!(config.token, "file-token");
        assert_eq!(config.local_http, "127.0.0.1:8080");
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_token_from_environment_variable() {
        let var = format!("EDGELINK_TEST_TOKEN_{}", std::process::id());
        std::env::set_var(&var, "env-token");
        let path = write_config(
            "token-env",
            &format!(
                "manager_url: wss://manager/api/tunnel/connect\nenvironment_id: env-3\ntoken_env: {}\n",
                var
            ),
        );

        let config = build_agent_config(Some(&path), AgentOverrides::default()).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.token, "env-token");
    }

    #[test]
    fn test_missing_required_values() {
        let err = build_agent_config(None, AgentOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("Manager URL is required"));

        let err = build_agent_config(
            None,
            AgentOverrides {
                manager_url: Some("ws://m/api/tunnel/connect".into()),
                environment_id: Some("env".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("Pairing token is required"));
    }

    #[test]
    fn test_manager_validation() {
        let mut config = ManagerConfig::default();
        assert!(config.validate().is_err());

        config.jwt_secret = "a-long-enough-secret".into();
        assert!(config.validate().is_ok());

        config.heartbeat.closed_after = config.heartbeat.degraded_after;
        assert!(config.validate().is_err());
    }
}
