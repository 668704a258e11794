//! Manager side of the edge tunnel
//!
//! Agents dial in and are registered per environment in a [`TunnelRegistry`].
//! Callers route requests and streams through it by environment id.
pub mod connection;
pub mod error;
pub mod pending_requests;
pub mod registry;
pub mod status;

pub use connection::{CloseReason, ConnectionConfig, ConnectionInfo, TunnelConnection};
pub use error::TunnelError;
pub use pending_requests::{PendingError, PendingRequests, PendingResponse, RequestOutcome};
pub use registry::TunnelRegistry;
pub use status::{EnvironmentStatus, EnvironmentStatusStore, MemoryStatusStore, StatusRecord};
