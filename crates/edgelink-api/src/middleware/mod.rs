//! API Middleware
//!
//! Middleware layers for agent authentication.

pub mod auth;

pub use auth::{require_pairing, PairedAgent, PairingState};
