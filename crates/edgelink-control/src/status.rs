//! Environment status reporting

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Reachability of an environment as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Online,
    Offline,
}

/// Receives environment status changes as tunnels come and go.
///
/// Implementations own their failure handling; the tunnel never waits on a
/// store error.
#[async_trait]
pub trait EnvironmentStatusStore: Send + Sync {
    async fn set_status(&self, environment_id: &str, status: EnvironmentStatus, last_seen: DateTime<Utc>);
}

/// A recorded status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub status: EnvironmentStatus,
    pub last_seen: DateTime<Utc>,
}

/// In-memory status store
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: DashMap<String, StatusRecord>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, environment_id: &str) -> Option<StatusRecord> {
        self.records.get(environment_id).map(|r| r.value().clone())
    }

    pub fn all(&self) -> Vec<(String, StatusRecord)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl EnvironmentStatusStore for MemoryStatusStore {
    async fn set_status(&self, environment_id: &str, status: EnvironmentStatus, last_seen: DateTime<Utc>) {
        tracing::debug!(environment_id = %environment_id, ?status, "Environment status updated");
        self.records
            .insert(environment_id.to_string(), StatusRecord { status, last_seen });
    }
}
