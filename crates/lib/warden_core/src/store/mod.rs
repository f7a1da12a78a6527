//! Credential store: users, groups and single-use tokens.
//!
//! [`IdentityRepository`] is the persistence seam. Every method is one
//! atomic unit against the backing store; uniqueness and single-use
//! guarantees come from the store's transaction boundary, never from a
//! check-then-act sequence in the caller.
//!
//! [`CredentialStore`] wraps a repository with the password hasher and
//! token generation. Plaintext codes never reach the repository, only their
//! SHA-256 digests.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::auth::AuthError;
use crate::auth::password::PasswordHasher;
use crate::clock::expiry_after;
use crate::models::identity::{
    FederatedClaim, Group, IssuedToken, LoginRecord, NewUser, User, UserAttributes, UserProfile,
};

/// Random bytes per token; encodes to 32 URL-safe characters.
const CODE_BYTES: usize = 24;

/// What a successful activation token redemption does to its owner.
#[derive(Debug, Clone)]
pub enum Redemption {
    /// Mark the user activated (no-op if already activated).
    Activate,
    /// Replace the password hash, activate if needed and invalidate bearer
    /// tokens issued before now.
    PasswordReset { password_hash: String },
}

/// Persistence primitives behind [`CredentialStore`].
///
/// Token methods receive the code digest. Lookups by username or email are
/// case-insensitive. Token expiry is evaluated against the store's own
/// notion of "now".
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, AuthError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, AuthError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AuthError>;

    /// Insert a user, filling a missing username with `user-<id>`.
    /// Fails with `DuplicateIdentity` naming the clashing field.
    async fn insert_user(&self, user: NewUser) -> Result<User, AuthError>;

    async fn update_password_hash(&self, user_id: i64, password_hash: &str)
    -> Result<(), AuthError>;

    async fn set_enabled(&self, user_id: i64, enabled: bool) -> Result<User, AuthError>;

    /// Run `update` against the user as currently stored and persist its
    /// profile, all under one row lock. Only the profile is written back.
    async fn update_profile(
        &self,
        user_id: i64,
        update: &(dyn for<'u> Fn(&'u mut User) + Send + Sync),
    ) -> Result<User, AuthError>;

    /// Stamp `last_login_at`/`last_login_ip`, reporting whether this was the
    /// first recorded login.
    async fn record_login(&self, user_id: i64, ip: Option<&str>) -> Result<LoginRecord, AuthError>;

    /// Store a new activation token for the user, superseding the previous
    /// one. Returns its expiry.
    async fn replace_activation_token(
        &self,
        user_id: i64,
        code_hash: &str,
        ttl_seconds: i64,
    ) -> Result<DateTime<Utc>, AuthError>;

    /// Owner of a live activation token, without consuming it.
    async fn find_user_by_activation_token(&self, code_hash: &str) -> Result<User, AuthError>;

    /// Consume an activation token and apply `redemption` to its owner.
    async fn redeem_activation_token(
        &self,
        code_hash: &str,
        redemption: Redemption,
    ) -> Result<User, AuthError>;

    async fn replace_authorization_code(
        &self,
        user_id: i64,
        client_id: &str,
        code_hash: &str,
        ttl_seconds: i64,
    ) -> Result<DateTime<Utc>, AuthError>;

    /// Consume an authorization code. A code issued to another client is
    /// reported as `TokenNotFound`.
    async fn redeem_authorization_code(
        &self,
        client_id: &str,
        code_hash: &str,
    ) -> Result<User, AuthError>;

    /// Create-or-fetch the user owning `email` for a federated login.
    ///
    /// A created user is activated with `registration_source = provider_id`
    /// and `first_login = true`. An existing user gets `first_login = false`,
    /// loses any pending activation token and is activated if it was not.
    async fn claim_federated_user(
        &self,
        email: &str,
        provider_id: &str,
    ) -> Result<FederatedClaim, AuthError>;

    async fn groups_for_user(&self, user_id: i64) -> Result<Vec<Group>, AuthError>;

    /// Fetch a group by name, creating it if missing.
    async fn ensure_group(&self, name: &str, description: Option<&str>)
    -> Result<Group, AuthError>;

    /// Idempotent.
    async fn add_user_to_group(&self, user_id: i64, group_id: i64) -> Result<(), AuthError>;

    /// If no group exists, create the admin group and add the user to it.
    /// Returns whether this call did the promotion.
    async fn bootstrap_admin(&self, user_id: i64) -> Result<bool, AuthError>;

    /// Delete expired activation tokens and authorization codes.
    async fn purge_expired_tokens(&self) -> Result<u64, AuthError>;
}

/// Generate a fresh token: 24 bytes from the thread-local CSPRNG, base64url
/// without padding.
pub fn generate_code() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest of a code, as persisted.
pub fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The credential store used by every service.
#[derive(Clone)]
pub struct CredentialStore {
    repo: Arc<dyn IdentityRepository>,
    hasher: Arc<dyn PasswordHasher>,
}

impl CredentialStore {
    pub fn new(repo: Arc<dyn IdentityRepository>, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self { repo, hasher }
    }

    pub fn repository(&self) -> &Arc<dyn IdentityRepository> {
        &self.repo
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>, AuthError> {
        self.repo.find_user_by_id(id).await
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        self.repo.find_user_by_username(username).await
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        self.repo.find_user_by_email(email).await
    }

    /// Hash `plaintext` off the async runtime.
    pub async fn hash_password(&self, plaintext: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|e| AuthError::Internal(format!("hash task: {e}")))?
    }

    pub async fn set_password(&self, user: &User, plaintext: &str) -> Result<(), AuthError> {
        let hash = self.hash_password(plaintext).await?;
        self.repo.update_password_hash(user.id, &hash).await
    }

    /// `false` when the user has no password or the stored hash is malformed.
    pub async fn verify_password(&self, user: &User, plaintext: &str) -> bool {
        let Some(hash) = user.password_hash.clone() else {
            return false;
        };
        let hasher = self.hasher.clone();
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&hash, &plaintext))
            .await
            .unwrap_or(false)
    }

    /// Create a user from plaintext attributes.
    pub async fn create_user(&self, attributes: UserAttributes) -> Result<User, AuthError> {
        let password_hash = match attributes.password.as_deref() {
            Some(plaintext) => Some(self.hash_password(plaintext).await?),
            None => None,
        };
        let profile = UserProfile {
            full_name: attributes.full_name,
            registration_source: Some(attributes.registration_source),
            ..UserProfile::default()
        };
        let user = self
            .repo
            .insert_user(NewUser {
                username: attributes.username.filter(|u| !u.is_empty()),
                email: attributes.email.filter(|e| !e.is_empty()),
                password_hash,
                activated: attributes.activated,
                profile,
            })
            .await?;
        debug!(user_id = user.id, "user created");
        Ok(user)
    }

    pub async fn issue_activation_token(
        &self,
        user: &User,
        ttl_seconds: i64,
    ) -> Result<IssuedToken, AuthError> {
        expiry_after(Utc::now(), ttl_seconds)?;
        let code = generate_code();
        let expires_at = self
            .repo
            .replace_activation_token(user.id, &hash_code(&code), ttl_seconds)
            .await?;
        debug!(user_id = user.id, %expires_at, "activation token issued");
        Ok(IssuedToken {
            code,
            ttl_seconds,
            expires_at,
        })
    }

    pub async fn lookup_activation_token(&self, code: &str) -> Result<User, AuthError> {
        self.repo
            .find_user_by_activation_token(&hash_code(code))
            .await
    }

    pub async fn redeem_activation_token(
        &self,
        code: &str,
        redemption: Redemption,
    ) -> Result<User, AuthError> {
        self.repo
            .redeem_activation_token(&hash_code(code), redemption)
            .await
    }

    pub async fn issue_authorization_code(
        &self,
        user: &User,
        client_id: &str,
        ttl_seconds: i64,
    ) -> Result<IssuedToken, AuthError> {
        expiry_after(Utc::now(), ttl_seconds)?;
        let code = generate_code();
        let expires_at = self
            .repo
            .replace_authorization_code(user.id, client_id, &hash_code(&code), ttl_seconds)
            .await?;
        debug!(user_id = user.id, client_id, "authorization code issued");
        Ok(IssuedToken {
            code,
            ttl_seconds,
            expires_at,
        })
    }

    pub async fn redeem_authorization_code(
        &self,
        client_id: &str,
        code: &str,
    ) -> Result<User, AuthError> {
        self.repo
            .redeem_authorization_code(client_id, &hash_code(code))
            .await
    }

    pub async fn membership(&self, user: &User) -> Result<Vec<Group>, AuthError> {
        self.repo.groups_for_user(user.id).await
    }

    pub async fn add_to_group(&self, user: &User, group: &Group) -> Result<(), AuthError> {
        self.repo.add_user_to_group(user.id, group.id).await
    }

    pub async fn ensure_group(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Group, AuthError> {
        self.repo.ensure_group(name, description).await
    }

    pub async fn record_login(
        &self,
        user: &User,
        ip: Option<std::net::IpAddr>,
    ) -> Result<LoginRecord, AuthError> {
        let ip = ip.map(|ip| ip.to_string());
        self.repo.record_login(user.id, ip.as_deref()).await
    }

    pub async fn claim_federated_user(
        &self,
        email: &str,
        provider_id: &str,
    ) -> Result<FederatedClaim, AuthError> {
        self.repo.claim_federated_user(email, provider_id).await
    }

    pub async fn bootstrap_admin(&self, user: &User) -> Result<bool, AuthError> {
        self.repo.bootstrap_admin(user.id).await
    }

    pub async fn set_enabled(&self, user: &User, enabled: bool) -> Result<User, AuthError> {
        self.repo.set_enabled(user.id, enabled).await
    }

    /// Read-modify-write of the stored profile. `update` sees the current
    /// row, so concurrent updates never overwrite each other's keys.
    pub async fn update_profile(
        &self,
        user: &User,
        update: &(dyn for<'u> Fn(&'u mut User) + Send + Sync),
    ) -> Result<User, AuthError> {
        self.repo.update_profile(user.id, update).await
    }

    pub async fn purge_expired_tokens(&self) -> Result<u64, AuthError> {
        self.repo.purge_expired_tokens().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_32_url_safe_chars() {
        let code = generate_code();
        assert_eq!(code.len(), 32);
        assert!(
            code.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(code, generate_code());
    }

    #[test]
    fn code_hash_is_stable_hex() {
        let digest = hash_code("abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_code("abc"));
        assert_ne!(digest, hash_code("abd"));
    }
}
