//! Forgot-password and reset-password workflow.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use super::AuthError;
use super::events::{AuthEvent, EventBus};
use super::mail::{MailDispatcher, TEMPLATE_FORGOT_PASSWORD, code_link};
use crate::config::AuthPolicy;
use crate::models::identity::User;
use crate::store::{CredentialStore, Redemption};

/// Operation name carried by the `AuthSensitiveOperation` event after a
/// reset.
pub const OPERATION_PASSWORD_RESET: &str = "password_reset";

/// Answer to a reset request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// A reset link was mailed.
    Issued { expires_in: i64 },
    /// Nothing was sent. Only returned when uniform responses are on, so the
    /// caller can answer exactly as for `Issued`.
    Suppressed,
}

#[derive(Clone)]
pub struct CredentialRecovery {
    store: CredentialStore,
    events: EventBus,
    mailer: Arc<dyn MailDispatcher>,
    policy: Arc<AuthPolicy>,
}

impl CredentialRecovery {
    pub fn new(
        store: CredentialStore,
        events: EventBus,
        mailer: Arc<dyn MailDispatcher>,
        policy: Arc<AuthPolicy>,
    ) -> Self {
        Self {
            store,
            events,
            mailer,
            policy,
        }
    }

    /// Mail a password reset link to the owner of `email`.
    pub async fn request_reset(&self, email: &str) -> Result<ResetOutcome, AuthError> {
        let user = match self.store.find_by_email(email).await? {
            Some(user) if user.can_login() => user,
            _ => {
                debug!("password reset refused");
                return self.refuse(email);
            }
        };

        let ttl = self.policy.activation_token_expiry_seconds;
        let issued = self.store.issue_activation_token(&user, ttl).await?;
        let context = json!({
            "link": code_link(&self.policy.reset_password_url, &issued.code),
            "user": {
                "id": user.id,
                "email": user.email,
                "friendly_name": user.friendly_name(),
            },
            "expiration_hours": ttl / 3600,
        });
        let to = user.email.as_deref().unwrap_or(email);
        self.mailer.send(to, TEMPLATE_FORGOT_PASSWORD, context).await?;

        info!(user_id = user.id, "password reset requested");
        Ok(ResetOutcome::Issued { expires_in: ttl })
    }

    fn refuse(&self, email: &str) -> Result<ResetOutcome, AuthError> {
        if self.policy.uniform_reset_response {
            Ok(ResetOutcome::Suppressed)
        } else {
            Err(AuthError::CannotResetPassword(format!(
                "Cannot reset password for email: {email}"
            )))
        }
    }

    /// The user a reset code belongs to. Does not consume the code.
    pub async fn resolve_token(&self, code: &str) -> Result<User, AuthError> {
        self.store.lookup_activation_token(code).await
    }

    /// Consume the reset code and set the new password.
    ///
    /// Bearer tokens issued before this call stop resolving.
    pub async fn complete_reset(&self, code: &str, new_password: &str) -> Result<User, AuthError> {
        let password_hash = self.store.hash_password(new_password).await?;
        let user = self
            .store
            .redeem_activation_token(code, Redemption::PasswordReset { password_hash })
            .await?;

        self.events
            .notify(AuthEvent::PasswordReset { user: user.clone() })
            .await?;
        self.events
            .notify(AuthEvent::AuthSensitiveOperation {
                user: user.clone(),
                operation: OPERATION_PASSWORD_RESET.to_string(),
            })
            .await?;

        info!(user_id = user.id, "password reset completed");
        Ok(user)
    }
}
