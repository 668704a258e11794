//! Errors surfaced to callers routing through the tunnel

use thiserror::Error;

/// Tunnel routing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// No connection for the environment, or it is not routable
    #[error("Environment {0} is offline")]
    EnvironmentOffline(String),

    #[error("Request timed out")]
    Timeout,

    /// The connection was already closed when the call was made
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection went away while the call was in flight
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The agent could not execute the request locally
    #[error("Agent error ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("Id {0} is already in use on this connection")]
    DuplicateId(String),

    /// The request could not be put on the wire
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TunnelError {
    /// Whether retrying on a fresh connection could succeed
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TunnelError::EnvironmentOffline(_)
                | TunnelError::ConnectionClosed
                | TunnelError::ConnectionLost(_)
        )
    }
}
