//! Edgelink CLI - run the manager, run an agent, or issue pairing tokens
//!
//! The manager accepts agent tunnels and proxies API calls to the
//! environments behind them. An agent runs next to a container engine and
//! keeps its tunnel to the manager open.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{build_agent_config, AgentOverrides, ManagerConfig};
use edgelink_agent::Agent;
use edgelink_api::ApiServer;
use edgelink_auth::{JwtCredentialValidator, PairingToken};
use edgelink_control::{MemoryStatusStore, TunnelRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ")");

/// Edgelink - reach remote container environments through agent tunnels
#[derive(Parser, Debug)]
#[command(name = "edgelink")]
#[command(about = "Edgelink - reach remote container environments through agent tunnels")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "EDGELINK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the manager: accept agent tunnels and serve the proxy API
    Manager {
        /// Address to bind the API server to
        #[arg(long, env = "EDGELINK_BIND", default_value = "0.0.0.0:3552")]
        bind: SocketAddr,

        /// Secret used to verify pairing tokens
        #[arg(long, env = "EDGELINK_JWT_SECRET")]
        jwt_secret: String,

        /// Deadline for each proxied request, in seconds
        #[arg(long, default_value = "30")]
        request_timeout: u64,

        /// Seconds between heartbeats sent to each agent
        #[arg(long, default_value = "10")]
        heartbeat_interval: u64,

        /// Seconds without an acknowledgement before an agent is degraded
        #[arg(long, default_value = "15")]
        degraded_after: u64,

        /// Seconds without an acknowledgement before an agent is dropped
        #[arg(long, default_value = "45")]
        closed_after: u64,
    },

    /// Run an agent: dial the manager and serve the local container engine
    #[command(long_about = r#"
Dial the manager and serve proxied requests against the local container
engine. Reconnects with exponential backoff when the tunnel drops.

EXAMPLES:
  # Using flags
  edgelink agent --manager-url wss://manager.example.com/api/tunnel/connect \
    --environment-id prod-1 --token $EDGELINK_TOKEN

  # Using a config file (flags override file values)
  edgelink agent --config agent.yaml

CONFIG FILE:
  manager_url: wss://manager.example.com/api/tunnel/connect
  environment_id: prod-1
  token_env: EDGELINK_TOKEN
  local_http: 127.0.0.1:2375
  reconnect:
    initial_backoff: 1
    max_backoff: 30
    "#)]
    Agent {
        /// Path to a YAML config file
        #[arg(short, long, env = "EDGELINK_CONFIG")]
        config: Option<PathBuf>,

        /// Manager tunnel URL (ws:// or wss://)
        #[arg(long, env = "EDGELINK_MANAGER_URL")]
        manager_url: Option<String>,

        /// Environment this agent serves
        #[arg(long, env = "EDGELINK_ENVIRONMENT_ID")]
        environment_id: Option<String>,

        /// Pairing token issued by the manager
        #[arg(long, env = "EDGELINK_TOKEN")]
        token: Option<String>,

        /// Address of the local container engine API
        #[arg(long, env = "EDGELINK_LOCAL_HTTP")]
        local_http: Option<String>,

        /// Base URL for local streams (defaults to ws://<local-http>)
        #[arg(long, env = "EDGELINK_LOCAL_WS")]
        local_ws: Option<String>,
    },

    /// Issue a pairing token for an environment
    Token {
        /// Secret the manager verifies tokens with
        #[arg(long, env = "EDGELINK_JWT_SECRET")]
        jwt_secret: String,

        /// Environment the token pairs
        #[arg(long)]
        environment_id: String,

        /// Token validity in hours
        #[arg(long, default_value = "8760")]
        valid_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // wss:// dials need a process-wide provider; a second install is harmless
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Manager {
            bind,
            jwt_secret,
            request_timeout,
            heartbeat_interval,
            degraded_after,
            closed_after,
        } => {
            let mut config = ManagerConfig {
                bind_addr: bind,
                jwt_secret,
                request_timeout: Duration::from_secs(request_timeout),
                ..Default::default()
            };
            config.heartbeat.interval = Duration::from_secs(heartbeat_interval);
            config.heartbeat.degraded_after = Duration::from_secs(degraded_after);
            config.heartbeat.closed_after = Duration::from_secs(closed_after);

            run_manager(config).await
        }
        Commands::Agent {
            config,
            manager_url,
            environment_id,
            token,
            local_http,
            local_ws,
        } => {
            let overrides = AgentOverrides {
                manager_url,
                environment_id,
                token,
                local_http,
                local_ws,
            };
            let config = build_agent_config(config.as_deref(), overrides)?;
            run_agent(config).await
        }
        Commands::Token {
            jwt_secret,
            environment_id,
            valid_hours,
        } => {
            let token = PairingToken::issue(
                jwt_secret.as_bytes(),
                &environment_id,
                chrono::Duration::hours(valid_hours),
            )
            .context("Failed to issue pairing token")?;
            println!("{}", token);
            Ok(())
        }
    }
}

async fn run_manager(config: ManagerConfig) -> Result<()> {
    config.validate()?;

    info!("Edgelink manager {} starting...", VERSION);
    info!("Heartbeat interval: {:?}", config.heartbeat.interval);

    let registry = TunnelRegistry::new(
        Arc::new(MemoryStatusStore::new()),
        config.connection_config(),
    );
    let validator = Arc::new(JwtCredentialValidator::new(config.jwt_secret.as_bytes()));
    let server = ApiServer::new(config.api_config(), registry.clone(), validator);

    server
        .start(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
            }
        })
        .await?;

    registry.shutdown().await;
    info!("Manager stopped");
    Ok(())
}

async fn run_agent(config: edgelink_agent::AgentConfig) -> Result<()> {
    info!("Edgelink agent {} starting...", VERSION);
    info!("Environment: {}", config.environment_id);
    info!("Manager: {}", config.manager_url);
    info!("Local engine: {}", config.local_http);

    let agent = Agent::from_config(&config).context("Failed to create agent")?;
    let shutdown = CancellationToken::new();

    let agent_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }

    if let Err(e) = agent_task.await {
        error!("Agent task failed: {}", e);
    }

    info!("Agent stopped");
    Ok(())
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_agent_flags() {
        let cli = Cli::try_parse_from([
            "edgelink",
            "--log-level",
            "debug",
            "agent",
            "--manager-url",
            "ws://127.0.0.1:3552/api/tunnel/connect",
            "--environment-id",
            "env-1",
            "--token",
            "secret-token",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Agent {
                environment_id,
                token,
                config,
                ..
            } => {
                assert_eq!(environment_id.as_deref(), Some("env-1"));
                assert_eq!(token.as_deref(), Some("secret-token"));
                assert!(config.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
