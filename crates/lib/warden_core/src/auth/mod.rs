//! Authentication, session and credential workflows.
//!
//! Provides password hashing, bearer token management, principal derivation
//! and the login, sign-up and recovery services built on top of
//! [`crate::store::CredentialStore`].

pub mod bootstrap;
pub mod events;
pub mod jwt;
pub mod mail;
pub mod password;
pub mod principals;
pub mod recovery;
pub mod session;
pub mod signup;

use thiserror::Error;

/// Generic message for every credential rejection. Never reveals whether the
/// identifier or the password was wrong.
pub const INVALID_CREDENTIALS: &str = "Invalid username or password.";

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    AuthenticationFailure(String),

    #[error("Identity already registered: {0}")]
    DuplicateIdentity(String),

    #[error("Token not found")]
    TokenNotFound,

    #[error("Token expired")]
    TokenExpired,

    #[error("Incomplete profile: {0}")]
    IncompleteProfile(String),

    #[error("Unsupported identity provider: {0}")]
    UnsupportedProvider(String),

    #[error("Cannot reset password: {0}")]
    CannotResetPassword(String),

    #[error("Cannot create authorization code: {0}")]
    CannotCreateAuthorizationCode(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// The generic credential rejection.
    pub fn invalid_credentials() -> Self {
        AuthError::AuthenticationFailure(INVALID_CREDENTIALS.to_string())
    }

    /// Whether this error came from the backing store rather than from a
    /// policy or validation decision.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, AuthError::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_credentials_message_is_generic() {
        let err = AuthError::invalid_credentials();
        assert_eq!(err.to_string(), "Invalid username or password.");
    }

    #[test]
    fn token_errors_only_say_not_found_or_expired() {
        assert_eq!(AuthError::TokenNotFound.to_string(), "Token not found");
        assert_eq!(AuthError::TokenExpired.to_string(), "Token expired");
    }

    #[test]
    fn sqlx_errors_become_store_unavailable() {
        let err: AuthError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_store_unavailable());
    }
}
