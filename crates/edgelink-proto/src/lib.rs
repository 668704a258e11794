//! Edge tunnel protocol definitions
//!
//! This crate defines the envelope exchanged between the manager and its agents
//! and the JSON codec that carries it, one envelope per WebSocket text frame.

pub mod codec;
pub mod envelope;

pub use codec::{CodecError, EnvelopeCodec};
pub use envelope::*;

/// Protocol version advertised on the tunnel upgrade request
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header carrying the environment id on the tunnel upgrade request
pub const ENVIRONMENT_ID_HEADER: &str = "x-environment-id";

/// Header carrying the protocol version on the tunnel upgrade request
pub const PROTOCOL_VERSION_HEADER: &str = "x-edgelink-protocol";
