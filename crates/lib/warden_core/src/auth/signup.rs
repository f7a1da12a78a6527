//! E-mail sign-up and activation.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use super::AuthError;
use super::events::{AuthEvent, EventBus};
use super::mail::{MailDispatcher, TEMPLATE_ACTIVATE, code_link};
use super::session::SessionService;
use crate::config::AuthPolicy;
use crate::models::auth::{BearerToken, LoginContext};
use crate::models::identity::{User, UserAttributes};
use crate::store::{CredentialStore, Redemption};

/// Registration source recorded for sign-ups through this workflow.
pub const SOURCE_EMAIL: &str = "email";

/// Sign-up form contents.
#[derive(Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub password: String,
    /// Generated as `user-<id>` when absent.
    pub username: Option<String>,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SignUpOutcome {
    /// An activation link was mailed.
    AwaitingActivation { user: User, expires_in: i64 },
    /// No activation needed and no autologin; the user logs in separately.
    Registered { user: User },
    LoggedIn { user: User, token: BearerToken },
}

#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    Activated { user: User },
    LoggedIn { user: User, token: BearerToken },
}

#[derive(Clone)]
pub struct SignUpService {
    store: CredentialStore,
    events: EventBus,
    mailer: Arc<dyn MailDispatcher>,
    session: SessionService,
    policy: Arc<AuthPolicy>,
}

impl SignUpService {
    pub fn new(
        store: CredentialStore,
        events: EventBus,
        mailer: Arc<dyn MailDispatcher>,
        session: SessionService,
        policy: Arc<AuthPolicy>,
    ) -> Self {
        Self {
            store,
            events,
            mailer,
            session,
            policy,
        }
    }

    pub async fn sign_up(
        &self,
        registration: Registration,
        ctx: &LoginContext,
    ) -> Result<SignUpOutcome, AuthError> {
        let user = self
            .store
            .create_user(UserAttributes {
                username: registration.username,
                email: Some(registration.email),
                password: Some(registration.password),
                full_name: registration.full_name,
                registration_source: SOURCE_EMAIL.to_string(),
                activated: false,
            })
            .await?;
        self.events
            .notify(AuthEvent::UserCreated { user: user.clone() })
            .await?;

        let mut expires_in = None;
        if self.policy.require_activation {
            expires_in = Some(self.send_activation(&user).await?);
        }

        self.events
            .notify(AuthEvent::NewRegistration {
                user: user.clone(),
                registration_source: SOURCE_EMAIL.to_string(),
            })
            .await?;
        info!(user_id = user.id, "user signed up");

        if self.policy.autologin {
            let token = self.session.authenticate_user(&user, ctx).await?;
            return Ok(SignUpOutcome::LoggedIn { user, token });
        }
        Ok(match expires_in {
            Some(expires_in) => SignUpOutcome::AwaitingActivation { user, expires_in },
            None => SignUpOutcome::Registered { user },
        })
    }

    /// Issue an activation token and mail the link. Returns the token
    /// lifetime.
    async fn send_activation(&self, user: &User) -> Result<i64, AuthError> {
        let Some(email) = user.email.as_deref() else {
            return Err(AuthError::IncompleteProfile("user has no email".into()));
        };
        let ttl = self.policy.activation_token_expiry_seconds;
        let issued = self.store.issue_activation_token(user, ttl).await?;
        let context = json!({
            "link": code_link(&self.policy.activation_url, &issued.code),
            "expiration_hours": ttl / 3600,
        });
        info!(user_id = user.id, "sending sign up email");
        self.mailer.send(email, TEMPLATE_ACTIVATE, context).await?;
        Ok(ttl)
    }

    /// Consume an activation code.
    pub async fn activate_by_email(
        &self,
        code: &str,
        ctx: &LoginContext,
    ) -> Result<ActivationOutcome, AuthError> {
        let user = self
            .store
            .redeem_activation_token(code, Redemption::Activate)
            .await?;

        if self.policy.login_after_activation {
            let token = self.session.authenticate_user(&user, ctx).await?;
            return Ok(ActivationOutcome::LoggedIn { user, token });
        }
        self.events
            .notify(AuthEvent::RegistrationActivated { user: user.clone() })
            .await?;
        Ok(ActivationOutcome::Activated { user })
    }
}
