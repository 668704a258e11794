//! Agent pairing credentials
//!
//! An agent proves which environment it serves with a pairing token issued by
//! the manager. Tokens are HS256 JWTs whose subject is the environment id.

pub mod pairing;

pub use pairing::{JwtCredentialValidator, PairingClaims, PairingError, PairingToken};

use async_trait::async_trait;

/// Checks the credential an agent presents when it opens a tunnel
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Accept or reject `token` for `environment_id`
    async fn validate(&self, environment_id: &str, token: &str) -> Result<(), PairingError>;
}
