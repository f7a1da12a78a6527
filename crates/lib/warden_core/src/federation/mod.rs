//! Federated (OAuth provider) identity reconciliation.
//!
//! The OAuth dance itself happens elsewhere. This module receives the
//! provider's already-verified user payload and maps it onto an internal
//! user, matching by e-mail.

pub mod facebook;
pub mod google;
pub mod twitter;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::auth::AuthError;
use crate::auth::events::{AuthEvent, EventBus};
use crate::models::identity::User;
use crate::store::CredentialStore;

pub use facebook::FacebookMapper;
pub use google::GoogleMapper;
pub use twitter::TwitterMapper;

/// Shown when the provider did not hand over an e-mail address.
pub const MISSING_EMAIL: &str = "Email address is needed in order to use this service and we \
     could not get one from your social media provider. Please try to sign up with your email \
     instead.";

/// Provider payload normalized by a mapper.
#[derive(Debug, Clone, Default)]
pub struct ImportedProfile {
    pub email: Option<String>,
    /// Stored under `social.<provider_id>`.
    pub data: Map<String, Value>,
}

/// Per-provider mapping from a raw payload onto a user.
pub trait ProviderProfileMapper: Send + Sync {
    fn provider_id(&self) -> &str;

    fn import_profile(&self, raw: &Value) -> Result<ImportedProfile, AuthError>;

    /// Runs once, right after the user was created. Only fills blanks.
    fn on_first_login(&self, _user: &mut User, _profile: &ImportedProfile) {}

    /// Runs on every login. Merges provider data without removing keys.
    fn on_every_login(&self, user: &mut User, profile: &ImportedProfile) {
        user.profile.merge_social(self.provider_id(), &profile.data);
    }
}

/// Copy `data[key]` into the user's full name if it has none.
pub(crate) fn fill_full_name(user: &mut User, data: &Map<String, Value>, key: &str) {
    let empty = user.profile.full_name.as_deref().is_none_or(str::is_empty);
    if empty
        && let Some(name) = data.get(key).and_then(Value::as_str)
        && !name.is_empty()
    {
        user.profile.full_name = Some(name.to_string());
    }
}

/// Pick string fields out of `raw`, trying each alias in order. Missing
/// fields are stored as `null`.
pub(crate) fn pick(raw: &Value, fields: &[(&str, &[&str])]) -> Map<String, Value> {
    let mut out = Map::new();
    for (target, aliases) in fields {
        let value = aliases
            .iter()
            .find_map(|alias| raw.get(*alias).filter(|v| !v.is_null()))
            .cloned()
            .unwrap_or(Value::Null);
        out.insert((*target).to_string(), value);
    }
    out
}

pub(crate) fn email_of(data: &Map<String, Value>) -> Option<String> {
    data.get("email")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
}

/// Mappers by provider id.
#[derive(Clone, Default)]
pub struct MapperRegistry {
    mappers: BTreeMap<String, Arc<dyn ProviderProfileMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Google, Facebook and Twitter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GoogleMapper));
        registry.register(Arc::new(FacebookMapper));
        registry.register(Arc::new(TwitterMapper));
        registry
    }

    pub fn register(&mut self, mapper: Arc<dyn ProviderProfileMapper>) {
        self.mappers.insert(mapper.provider_id().to_string(), mapper);
    }

    pub fn get(&self, provider_id: &str) -> Option<&Arc<dyn ProviderProfileMapper>> {
        self.mappers.get(provider_id)
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.mappers.keys().map(String::as_str).collect()
    }
}

#[derive(Clone)]
pub struct FederationReconciler {
    store: CredentialStore,
    events: EventBus,
    mappers: MapperRegistry,
}

impl FederationReconciler {
    pub fn new(store: CredentialStore, events: EventBus, mappers: MapperRegistry) -> Self {
        Self {
            store,
            events,
            mappers,
        }
    }

    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }

    /// Map a provider payload to an internal user, creating it on first
    /// sight of the e-mail address.
    pub async fn reconcile(&self, provider_id: &str, raw: &Value) -> Result<User, AuthError> {
        let mapper = self
            .mappers
            .get(provider_id)
            .ok_or_else(|| AuthError::UnsupportedProvider(provider_id.to_string()))?;

        let imported = mapper.import_profile(raw)?;
        let email = imported
            .email
            .clone()
            .ok_or_else(|| AuthError::IncompleteProfile(MISSING_EMAIL.to_string()))?;

        let claim = self.store.claim_federated_user(&email, provider_id).await?;
        let created = claim.created;
        if created {
            info!(user_id = claim.user.id, provider_id, "user created from federated login");
            self.events
                .notify(AuthEvent::UserCreated {
                    user: claim.user.clone(),
                })
                .await?;
        } else {
            debug!(user_id = claim.user.id, provider_id, "federated login matched existing user");
        }

        // Merged against the stored row: another login for the same e-mail
        // may have landed since the claim.
        self.store
            .update_profile(&claim.user, &|user: &mut User| {
                if created {
                    mapper.on_first_login(user, &imported);
                }
                mapper.on_every_login(user, &imported);
            })
            .await
    }
}
