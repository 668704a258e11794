//! JWT pairing tokens

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::CredentialValidator;

/// Default issuer written into pairing tokens
pub const DEFAULT_ISSUER: &str = "edgelink-manager";

/// Claims carried by a pairing token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingClaims {
    /// Subject (environment ID)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
}

impl PairingClaims {
    pub fn new(environment_id: impl Into<String>, issuer: impl Into<String>, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: environment_id.into(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer.into(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Pairing errors
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token was issued for environment {token}, not {requested}")]
    EnvironmentMismatch { token: String, requested: String },

    #[error("Missing credentials")]
    MissingCredentials,
}

/// Issues pairing tokens
pub struct PairingToken;

impl PairingToken {
    /// Issue a token for `environment_id` using HMAC-SHA256
    pub fn issue(secret: &[u8], environment_id: &str, validity: Duration) -> Result<String, PairingError> {
        let claims = PairingClaims::new(environment_id, DEFAULT_ISSUER, validity);
        Self::encode(secret, &claims)
    }

    pub fn encode(secret: &[u8], claims: &PairingClaims) -> Result<String, PairingError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

/// Validates pairing tokens signed with a shared secret
pub struct JwtCredentialValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialValidator {
    /// Validates signature and expiration; audience is not used
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.leeway = 0;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Decode `token` and check that it was issued for `environment_id`
    pub fn validate(&self, token: &str, environment_id: &str) -> Result<PairingClaims, PairingError> {
        if token.is_empty() {
            return Err(PairingError::MissingCredentials);
        }

        let token_data = decode::<PairingClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => PairingError::TokenExpired,
                _ => PairingError::Jwt(e),
            })?;
        let claims = token_data.claims;

        if claims.is_expired() {
            return Err(PairingError::TokenExpired);
        }

        if claims.sub != environment_id {
            return Err(PairingError::EnvironmentMismatch {
                token: claims.sub,
                requested: environment_id.to_string(),
            });
        }

        debug!("Pairing token accepted for environment {}", environment_id);
        Ok(claims)
    }
}

#[async_trait]
impl CredentialValidator for JwtCredentialValidator {
    async fn validate(&self, environment_id: &str, token: &str) -> Result<(), PairingError> {
        JwtCredentialValidator::validate(self, token, environment_id).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    #[test]
    fn test_issue_and_validate() {
        let token = PairingToken::issue(TEST_SECRET, "env-1", Duration::hours(1)).unwrap();

        let validator = JwtCredentialValidator::new(TEST_SECRET).with_issuer(DEFAULT_ISSUER);
        let claims = validator.validate(&token, "env-1").unwrap();

        assert_eq!(claims.sub, "env-1");
        assert_eq!(claims.iss, DEFAULT_ISSUER);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_token_bound_to_environment() {
        let token = PairingToken::issue(TEST_SECRET, "env-1", Duration::hours(1)).unwrap();
        let validator = JwtCredentialValidator::new(TEST_SECRET);

        let result = validator.validate(&token, "env-2");
        assert!(matches!(
            result,
            Err(PairingError::EnvironmentMismatch { ref token, ref requested })
                if token == "env-1" && requested == "env-2"
        ));
    }

    #[test]
    fn test_expired_token() {
        let claims = PairingClaims::new("env-3", DEFAULT_ISSUER, Duration::seconds(-10));
        assert!(claims.is_expired());

        let token = PairingToken::encode(TEST_SECRET, &claims).unwrap();
        let validator = JwtCredentialValidator::new(TEST_SECRET);

        assert!(matches!(
            validator.validate(&token, "env-3"),
            Err(PairingError::TokenExpired)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = PairingToken::issue(b"another-secret", "env-4", Duration::hours(1)).unwrap();
        let validator = JwtCredentialValidator::new(TEST_SECRET);

        assert!(matches!(
            validator.validate(&token, "env-4"),
            Err(PairingError::Jwt(_))
        ));
        assert!(matches!(
            validator.validate("", "env-4"),
            Err(PairingError::MissingCredentials)
        ));
    }

    #[test]
    fn test_claims_wire_shape() {
        let claims = PairingClaims::new("env-5", "issuer", Duration::hours(1));
        let json = serde_json::to_value(&claims).unwrap();

        assert_eq!(json["sub"], "env-5");
        assert_eq!(json["iss"], "issuer");
        assert!(json.get("aud").is_none());
    }

    #[tokio::test]
    async fn test_credential_validator_trait() {
        let token = PairingToken::issue(TEST_SECRET, "env-6", Duration::hours(1)).unwrap();
        let validator: Box<dyn CredentialValidator> =
            Box::new(JwtCredentialValidator::new(TEST_SECRET));

        assert!(validator.validate("env-6", &token).await.is_ok());
        assert!(validator.validate("env-7", &token).await.is_err());
    }
}
