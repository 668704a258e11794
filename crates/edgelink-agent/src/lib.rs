//! Agent side of the edge tunnel
//!
//! The agent dials out to the manager, keeps the link alive across failures and
//! serves what arrives over it: proxied requests go to a [`LocalExecutor`],
//! streams to a [`LocalStreamOpener`].

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod local_stream;

pub use agent::{Agent, AgentState};
pub use config::AgentConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig, SessionEnd};
pub use executor::{HttpExecutor, LocalExecutor};
pub use local_stream::{DuplexChannel, LocalStreamOpener, WebSocketStreamOpener};

use edgelink_proto::RemoteError;
use thiserror::Error;

/// Failures of local work; reported to the manager, never fatal to the link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The local endpoint could not be reached
    #[error("Local endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Execution failed: {0}")]
    Failed(String),
}

impl DispatchError {
    /// Error code carried in the `response` error descriptor
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Unavailable(_) => "unavailable",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Failed(_) => "execution_failed",
        }
    }

    pub fn to_remote(&self) -> RemoteError {
        RemoteError::new(self.code(), self.to_string())
    }
}

/// Agent setup errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
