//! Bearer token (JWT) signing and verification.

use std::path::PathBuf;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tracing::info;

use super::AuthError;
use crate::clock::expiry_after;
use crate::config::JwtSettings;
use crate::models::auth::{BearerToken, TokenClaims};

/// Signs and verifies HS256 bearer tokens for one audience.
#[derive(Clone)]
pub struct BearerSigner {
    settings: JwtSettings,
}

impl BearerSigner {
    pub fn new(settings: JwtSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &JwtSettings {
        &self.settings
    }

    /// Mint a signed bearer token for `user_id`.
    pub fn mint(
        &self,
        user_id: i64,
        name: Option<&str>,
        admin: bool,
        principals: &[String],
    ) -> Result<BearerToken, AuthError> {
        let now = Utc::now();
        let lifetime = self.settings.access_token_expiry_seconds;
        let claims = TokenClaims {
            sub: user_id.to_string(),
            name: name.map(str::to_string),
            admin,
            principals: principals.to_vec(),
            aud: self.settings.audience.clone(),
            exp: expiry_after(now, lifetime)?.timestamp(),
            iat: now.timestamp(),
            iat_us: now.timestamp_micros(),
        };
        let access_token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.settings.secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenError(format!("jwt encode: {e}")))?;

        Ok(BearerToken {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: lifetime,
            user_id,
            principals: claims.principals,
        })
    }

    /// Verify signature, audience and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Option<TokenClaims> {
        let key = DecodingKey::from_secret(self.settings.secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_audience(&[self.settings.audience.as_str()]);
        decode::<TokenClaims>(token, &key, &validation)
            .ok()
            .map(|data| data.claims)
    }
}

/// Resolve the JWT secret: env var `JWT_SECRET` → `AUTH_SECRET` → persisted file.
pub fn resolve_jwt_secret() -> String {
    if let Ok(secret) = std::env::var("JWT_SECRET")
        && !secret.is_empty()
    {
        return secret;
    }
    if let Ok(secret) = std::env::var("AUTH_SECRET")
        && !secret.is_empty()
    {
        return secret;
    }
    load_or_create_secret(&jwt_secret_path())
}

/// Read the secret stored at `path`, generating and persisting a new one if
/// the file is missing or empty.
pub fn load_or_create_secret(path: &std::path::Path) -> String {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let secret: String = rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, &secret);
    info!(path = %path.display(), "generated new JWT secret");
    secret
}

/// Path to the persisted JWT secret file.
fn jwt_secret_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden")
        .join("jwt-secret")
}
