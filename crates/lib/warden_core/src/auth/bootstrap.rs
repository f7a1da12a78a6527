//! First-user promotion to the admin group.

use async_trait::async_trait;
use tracing::info;

use super::AuthError;
use super::events::{AuthEvent, EventSink};
use crate::models::identity::User;
use crate::store::CredentialStore;

/// Promotes the first user ever created into the admin group.
///
/// The check and the promotion happen in one store operation, so concurrent
/// first sign-ups create exactly one admin group with one member.
pub struct BootstrapPromoter {
    store: CredentialStore,
}

impl BootstrapPromoter {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    /// Returns whether `user` was promoted.
    pub async fn on_user_created(&self, user: &User) -> Result<bool, AuthError> {
        let promoted = self.store.bootstrap_admin(user).await?;
        if promoted {
            info!(user_id = user.id, "first user promoted to admin");
        }
        Ok(promoted)
    }
}

#[async_trait]
impl EventSink for BootstrapPromoter {
    async fn notify(&self, event: &AuthEvent) -> Result<(), AuthError> {
        if let AuthEvent::UserCreated { user } = event {
            self.on_user_created(user).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "BootstrapPromoter"
    }
}
