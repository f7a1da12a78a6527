//! Wiring: builds every service from its collaborators.

use std::sync::Arc;

use serde_json::Value;

use crate::auth::AuthError;
use crate::auth::bootstrap::BootstrapPromoter;
use crate::auth::events::{EventBus, EventSink, TracingEventSink};
use crate::auth::jwt::BearerSigner;
use crate::auth::mail::MailDispatcher;
use crate::auth::password::PasswordHasher;
use crate::auth::recovery::CredentialRecovery;
use crate::auth::session::SessionService;
use crate::auth::signup::SignUpService;
use crate::config::{AuthPolicy, JwtSettings};
use crate::federation::{FederationReconciler, MapperRegistry};
use crate::models::auth::{BearerToken, LoginContext};
use crate::models::identity::User;
use crate::store::{CredentialStore, IdentityRepository};

/// Collaborators handed to [`Authority::new`].
pub struct AuthorityParts {
    pub repository: Arc<dyn IdentityRepository>,
    pub hasher: Arc<dyn PasswordHasher>,
    pub mailer: Arc<dyn MailDispatcher>,
    /// Run after the built-in sinks, in order.
    pub extra_sinks: Vec<Arc<dyn EventSink>>,
    pub mappers: MapperRegistry,
    pub policy: AuthPolicy,
    pub jwt: JwtSettings,
}

/// The assembled identity authority.
///
/// The event bus always starts with the bootstrap promoter, followed by
/// the tracing sink and then any extra sinks.
#[derive(Clone)]
pub struct Authority {
    store: CredentialStore,
    events: EventBus,
    session: SessionService,
    recovery: CredentialRecovery,
    signup: SignUpService,
    federation: FederationReconciler,
}

impl Authority {
    pub fn new(parts: AuthorityParts) -> Self {
        let policy = Arc::new(parts.policy);
        let store = CredentialStore::new(parts.repository, parts.hasher);

        let mut events = EventBus::new(vec![
            Arc::new(BootstrapPromoter::new(store.clone())),
            Arc::new(TracingEventSink),
        ]);
        for sink in parts.extra_sinks {
            events.push(sink);
        }

        let session = SessionService::new(
            store.clone(),
            events.clone(),
            policy.clone(),
            BearerSigner::new(parts.jwt),
        );
        let recovery = CredentialRecovery::new(
            store.clone(),
            events.clone(),
            parts.mailer.clone(),
            policy.clone(),
        );
        let signup = SignUpService::new(
            store.clone(),
            events.clone(),
            parts.mailer,
            session.clone(),
            policy,
        );
        let federation = FederationReconciler::new(store.clone(), events.clone(), parts.mappers);

        Self {
            store,
            events,
            session,
            recovery,
            signup,
            federation,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self) -> &SessionService {
        &self.session
    }

    pub fn recovery(&self) -> &CredentialRecovery {
        &self.recovery
    }

    pub fn signup(&self) -> &SignUpService {
        &self.signup
    }

    pub fn federation(&self) -> &FederationReconciler {
        &self.federation
    }

    /// Reconcile a provider payload and log the resulting user in.
    pub async fn federated_login(
        &self,
        provider_id: &str,
        raw: &Value,
        ctx: &LoginContext,
    ) -> Result<(User, BearerToken), AuthError> {
        let user = self.federation.reconcile(provider_id, raw).await?;
        let token = self.session.authenticate_user(&user, ctx).await?;
        Ok((user, token))
    }
}
