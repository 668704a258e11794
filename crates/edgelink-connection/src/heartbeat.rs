//! Connection liveness state machine
//!
//! The monitor is pure: callers feed it events with the instant they were
//! observed and act on the returned transitions. The manager's heartbeat
//! driver owns the timer; the agent only answers.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Health of one tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Connecting,
    Online,
    /// Heartbeats are going unanswered; still routable
    Degraded,
    Closed,
}

impl HealthState {
    /// Whether new requests and streams may be routed to the connection
    pub fn is_routable(&self) -> bool {
        matches!(self, HealthState::Online | HealthState::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Connecting => "connecting",
            HealthState::Online => "online",
            HealthState::Degraded => "degraded",
            HealthState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat timing
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often the manager sends `heartbeat`
    #[serde(with = "crate::duration_secs")]
    pub interval: Duration,
    /// Outstanding heartbeat age that marks the connection degraded
    #[serde(with = "crate::duration_secs")]
    pub degraded_after: Duration,
    /// Outstanding heartbeat age that closes the connection
    #[serde(with = "crate::duration_secs")]
    pub closed_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            degraded_after: Duration::from_secs(15),
            closed_after: Duration::from_secs(45),
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("heartbeat interval must be greater than zero".to_string());
        }
        if self.degraded_after.is_zero() {
            return Err("degraded_after must be greater than zero".to_string());
        }
        if self.closed_after <= self.degraded_after {
            return Err("closed_after must be greater than degraded_after".to_string());
        }
        Ok(())
    }
}

/// A state change reported by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: HealthState,
    /// Send time of the oldest heartbeat not yet acknowledged
    unacked_since: Option<Instant>,
    last_seen: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: HealthState::Connecting,
            unacked_since: None,
            last_seen: None,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Last time the peer proved it was alive
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn on_handshake(&mut self, now: Instant) -> Option<Transition> {
        if self.state != HealthState::Connecting {
            return None;
        }
        self.last_seen = Some(now);
        self.transition(HealthState::Online)
    }

    pub fn on_heartbeat_sent(&mut self, now: Instant) {
        if self.state == HealthState::Closed {
            return;
        }
        if self.unacked_since.is_none() {
            self.unacked_since = Some(now);
        }
    }

    pub fn on_ack(&mut self, now: Instant) -> Option<Transition> {
        if self.state == HealthState::Closed {
            return None;
        }
        self.last_seen = Some(now);
        self.unacked_since = None;

        match self.state {
            HealthState::Degraded => self.transition(HealthState::Online),
            _ => None,
        }
    }

    /// Re-evaluate against the clock; called on every driver tick
    pub fn evaluate(&mut self, now: Instant) -> Option<Transition> {
        if !self.state.is_routable() {
            return None;
        }
        let since = self.unacked_since?;
        let outstanding = now.saturating_duration_since(since);

        if outstanding >= self.config.closed_after {
            self.transition(HealthState::Closed)
        } else if outstanding >= self.config.degraded_after && self.state == HealthState::Online {
            self.transition(HealthState::Degraded)
        } else {
            None
        }
    }

    /// When `evaluate` will next have something to report
    pub fn next_deadline(&self) -> Option<Instant> {
        let since = self.unacked_since?;
        match self.state {
            HealthState::Online => Some(since + self.config.degraded_after),
            HealthState::Degraded => Some(since + self.config.closed_after),
            HealthState::Connecting | HealthState::Closed => None,
        }
    }

    /// Closed for a reason other than missed heartbeats
    pub fn close(&mut self) -> Option<Transition> {
        self.transition(HealthState::Closed)
    }

    fn transition(&mut self, to: HealthState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        Some(Transition { from, to })
    }
}
