//! API response bodies

use edgelink_control::{ConnectionInfo, EnvironmentStatus};
use serde::{Deserialize, Serialize};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}

/// Connected environments
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentList {
    pub environments: Vec<ConnectionInfo>,
    pub total: usize,
}

/// Reachability of one environment
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentSummary {
    pub environment_id: String,
    pub status: EnvironmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connected_environments: usize,
}
