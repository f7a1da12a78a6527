//! Authentication session service.
//!
//! Verifies credentials, gates login on account state, mints bearer tokens
//! and records login telemetry. Holds no session state of its own; bearer
//! tokens are self-contained.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::AuthError;
use super::events::{AuthEvent, EventBus};
use super::jwt::BearerSigner;
use super::principals::{derive_principals, is_admin};
use crate::config::AuthPolicy;
use crate::models::auth::{AuthorizationRedirect, BearerToken, LoginContext, LogoutSignal};
use crate::models::identity::User;
use crate::store::CredentialStore;

/// Shown to a user whose account still awaits e-mail activation.
pub const NOT_ACTIVATED: &str = "Your account is not active, please check your e-mail. \
     If your account activation email has expired please request a password reset.";

/// Shown to a disabled user.
pub const CANNOT_LOGIN: &str = "This user account cannot log in at the moment.";

/// Login source recorded for authorization code exchanges.
pub const SOURCE_AUTHORIZATION_CODE: &str = "authorization_code";

#[derive(Clone)]
pub struct SessionService {
    store: CredentialStore,
    events: EventBus,
    policy: Arc<AuthPolicy>,
    signer: BearerSigner,
}

impl SessionService {
    pub fn new(
        store: CredentialStore,
        events: EventBus,
        policy: Arc<AuthPolicy>,
        signer: BearerSigner,
    ) -> Self {
        Self {
            store,
            events,
            policy,
            signer,
        }
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    pub fn signer(&self) -> &BearerSigner {
        &self.signer
    }

    /// Find the user by username, then by email when allowed, and verify
    /// the password. Every miss gives the same generic failure.
    pub async fn check_credentials(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        let mut found = self.store.find_by_username(identifier).await?;
        if found.is_none() && self.policy.allow_email_auth {
            found = self.store.find_by_email(identifier).await?;
        }
        let Some(user) = found else {
            debug!("login attempt for unknown identifier");
            return Err(AuthError::invalid_credentials());
        };
        if !self.store.verify_password(&user, password).await {
            warn!(user_id = user.id, "password mismatch");
            return Err(AuthError::invalid_credentials());
        }
        Ok(user)
    }

    /// Whether account state lets `user` hold a session under the current
    /// policy.
    fn check_login_allowed(&self, user: &User) -> Result<(), AuthError> {
        if !user.enabled {
            return Err(AuthError::AuthenticationFailure(CANNOT_LOGIN.to_string()));
        }
        let activation_waived = !self.policy.require_activation || self.policy.allow_inactive_login;
        if !user.is_activated() && !activation_waived {
            return Err(AuthError::AuthenticationFailure(NOT_ACTIVATED.to_string()));
        }
        Ok(())
    }

    /// Log `user` in: mint a bearer token and record the login.
    ///
    /// The login record is committed before `FirstLogin` and `Login` are
    /// dispatched. A failing sink fails the call but the record stays, so
    /// `FirstLogin` is delivered at most once.
    pub async fn authenticate_user(
        &self,
        user: &User,
        ctx: &LoginContext,
    ) -> Result<BearerToken, AuthError> {
        self.check_login_allowed(user)?;

        let groups = self.store.membership(user).await?;
        let principals = derive_principals(user, &groups, &self.policy);
        let token = self.signer.mint(
            user.id,
            user.username.as_deref(),
            is_admin(&groups),
            &principals,
        )?;

        let record = self.store.record_login(user, ctx.client_ip).await?;
        if record.first_login {
            self.events
                .notify(AuthEvent::FirstLogin {
                    user: record.user.clone(),
                })
                .await?;
        }
        self.events
            .notify(AuthEvent::Login {
                user: record.user,
                source: ctx.source.clone(),
            })
            .await?;

        info!(user_id = user.id, source = %ctx.source, "user logged in");
        Ok(token)
    }

    pub async fn authenticate_credentials(
        &self,
        identifier: &str,
        password: &str,
        ctx: &LoginContext,
    ) -> Result<BearerToken, AuthError> {
        let user = self.check_credentials(identifier, password).await?;
        self.authenticate_user(&user, ctx).await
    }

    /// Bearer tokens are stateless; logging out only clears the header.
    pub fn logout(&self) -> LogoutSignal {
        LogoutSignal::default()
    }

    /// Issue a single-use code `client_id` can exchange for a bearer token.
    pub async fn create_authorization_code(
        &self,
        user: &User,
        client_id: &str,
    ) -> Result<AuthorizationRedirect, AuthError> {
        let Some(redirect_uri) = self.policy.authorization_clients.get(client_id) else {
            return Err(AuthError::CannotCreateAuthorizationCode(format!(
                "unknown client {client_id}"
            )));
        };
        if !user.can_login() {
            return Err(AuthError::CannotCreateAuthorizationCode(
                "user cannot log in".into(),
            ));
        }
        let issued = self
            .store
            .issue_authorization_code(user, client_id, self.policy.authorization_code_expiry_seconds)
            .await?;
        Ok(AuthorizationRedirect {
            redirect_uri: redirect_uri.clone(),
            code: issued.code,
            client_id: client_id.to_string(),
            expires_in: issued.ttl_seconds,
        })
    }

    /// Exchange an authorization code for a bearer token.
    pub async fn create_access_token(
        &self,
        client_id: &str,
        code: &str,
        ctx: &LoginContext,
    ) -> Result<BearerToken, AuthError> {
        let user = match self.store.redeem_authorization_code(client_id, code).await {
            Ok(user) => user,
            Err(AuthError::TokenNotFound | AuthError::TokenExpired) => {
                return Err(AuthError::AuthenticationFailure(
                    "Invalid authorization code.".into(),
                ));
            }
            Err(e) => return Err(e),
        };
        self.authenticate_user(&user, ctx).await
    }

    /// Resolve the user behind a bearer token.
    ///
    /// Rejects bad signatures, expired tokens, unknown or locked-out users,
    /// and tokens issued before the user's last password change.
    pub async fn resolve_bearer(&self, token: &str) -> Result<User, AuthError> {
        let claims = self
            .signer
            .verify(token)
            .ok_or_else(|| AuthError::AuthenticationFailure("Invalid bearer token.".into()))?;
        let user_id: i64 = claims
            .sub
            .parse()
            .map_err(|_| AuthError::AuthenticationFailure("Invalid bearer token.".into()))?;
        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AuthError::AuthenticationFailure("Invalid bearer token.".into()))?;

        self.check_login_allowed(&user)?;
        let issued_at = claims
            .issued_at()
            .ok_or_else(|| AuthError::AuthenticationFailure("Invalid bearer token.".into()))?;
        if !user.is_valid_session(issued_at) {
            debug!(user_id, "bearer token predates sensitive operation");
            return Err(AuthError::AuthenticationFailure(
                "Session expired, please log in again.".into(),
            ));
        }
        Ok(user)
    }
}
