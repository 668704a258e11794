//! Per-connection tunnel machinery shared by the manager and the agent
//!
//! - [`WriteSerializer`]: one writer at a time on the physical connection
//! - [`StreamTable`]: multiplexed byte streams keyed by stream id
//! - [`HeartbeatMonitor`]: liveness state machine
//! - [`Backoff`]: capped exponential reconnect delays

pub mod heartbeat;
pub mod reconnect;
pub mod serializer;
pub mod streams;

pub use heartbeat::{HealthState, HeartbeatConfig, HeartbeatMonitor, Transition};
pub use reconnect::{Backoff, ReconnectConfig};
pub use serializer::WriteSerializer;
pub use streams::{
    overflow_close, DataOutcome, StreamConfig, StreamError, StreamReader, StreamSession,
    StreamTable, StreamWriter,
};

use edgelink_proto::CodecError;
use thiserror::Error;

/// Errors surfaced by [`WriteSerializer::send`]
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was torn down before or while the frame was written
    #[error("Connection closed")]
    Closed,

    /// The frame was not handed to the transport before its deadline
    #[error("Write timed out")]
    Timeout,

    /// The envelope could not be encoded; the connection is unaffected
    #[error("Encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// Serde helper: durations written as (fractional) seconds in config files
pub mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            serde::de::Error::custom(format!("invalid duration: {} seconds ({})", secs, e))
        })
    }
}
