//! In-process identity repository.
//!
//! All state sits behind one async mutex held for the whole of each
//! operation, which gives every method the same all-or-nothing behaviour as
//! a database transaction. Expiry is evaluated with the injected [`Clock`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{IdentityRepository, Redemption};
use crate::auth::AuthError;
use crate::clock::{Clock, SystemClock, expiry_after};
use crate::models::identity::{
    ADMIN_GROUP_NAME, FederatedClaim, Group, LoginRecord, NewUser, User, UserProfile,
    generated_username,
};

#[derive(Debug, Clone)]
struct TokenRecord {
    user_id: i64,
    client_id: Option<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    next_user_id: i64,
    next_group_id: i64,
    users: BTreeMap<i64, User>,
    groups: BTreeMap<i64, Group>,
    /// `(user_id, group_id)`
    memberships: BTreeSet<(i64, i64)>,
    activations: HashMap<String, TokenRecord>,
    activation_of_user: HashMap<i64, String>,
    authorization_codes: HashMap<String, TokenRecord>,
    authorization_code_of_user: HashMap<i64, String>,
}

impl State {
    fn user_mut(&mut self, user_id: i64) -> Result<&mut User, AuthError> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| AuthError::Internal(format!("user {user_id} not found")))
    }

    fn username_taken(&self, username: &str) -> bool {
        let wanted = username.to_lowercase();
        self.users.values().any(|u| {
            u.username
                .as_deref()
                .is_some_and(|n| n.to_lowercase() == wanted)
        })
    }

    fn email_owner(&self, email: &str) -> Option<&User> {
        let wanted = email.to_lowercase();
        self.users
            .values()
            .find(|u| u.email.as_deref().is_some_and(|e| e.to_lowercase() == wanted))
    }

    fn drop_activation_of(&mut self, user_id: i64) {
        if let Some(hash) = self.activation_of_user.remove(&user_id) {
            self.activations.remove(&hash);
        }
    }

    fn drop_authorization_code_of(&mut self, user_id: i64) {
        if let Some(hash) = self.authorization_code_of_user.remove(&user_id) {
            self.authorization_codes.remove(&hash);
        }
    }

    fn group_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.name == name)
    }

    fn insert_group(&mut self, name: &str, description: Option<&str>, now: DateTime<Utc>) -> Group {
        self.next_group_id += 1;
        let group = Group {
            id: self.next_group_id,
            uuid: Uuid::now_v7(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: now,
            data: Default::default(),
        };
        self.groups.insert(group.id, group.clone());
        group
    }
}

/// Identity repository kept in memory. Used by tests and embedded setups.
pub struct MemoryIdentityRepository {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
}

impl Default for MemoryIdentityRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityRepository {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            offline: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `StoreUnavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of groups. Test helper.
    pub async fn group_count(&self) -> usize {
        self.state.lock().await.groups.len()
    }

    /// Number of live (unconsumed) activation tokens. Test helper.
    pub async fn activation_token_count(&self) -> usize {
        self.state.lock().await.activations.len()
    }

    /// Override an activation token's expiry. Test helper.
    pub async fn set_activation_expiry(&self, user_id: i64, expires_at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        let Some(hash) = state.activation_of_user.get(&user_id).cloned() else {
            return false;
        };
        match state.activations.get_mut(&hash) {
            Some(record) => {
                record.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, State>, AuthError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthError::StoreUnavailable(sqlx::Error::PoolClosed));
        }
        Ok(self.state.lock().await)
    }

    fn live_record<'a>(
        &self,
        records: &'a HashMap<String, TokenRecord>,
        code_hash: &str,
    ) -> Result<&'a TokenRecord, AuthError> {
        let record = records.get(code_hash).ok_or(AuthError::TokenNotFound)?;
        if record.expires_at < self.clock.now() {
            return Err(AuthError::TokenExpired);
        }
        Ok(record)
    }
}

#[async_trait]
impl IdentityRepository for MemoryIdentityRepository {
    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, AuthError> {
        Ok(self.lock().await?.users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        let wanted = username.to_lowercase();
        Ok(self
            .lock()
            .await?
            .users
            .values()
            .find(|u| {
                u.username
                    .as_deref()
                    .is_some_and(|n| n.to_lowercase() == wanted)
            })
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        Ok(self.lock().await?.email_owner(email).cloned())
    }

    async fn insert_user(&self, new: NewUser) -> Result<User, AuthError> {
        let mut state = self.lock().await?;
        if let Some(email) = new.email.as_deref()
            && state.email_owner(email).is_some()
        {
            return Err(AuthError::DuplicateIdentity("email".into()));
        }
        let id = state.next_user_id + 1;
        let username = new.username.unwrap_or_else(|| generated_username(id));
        if state.username_taken(&username) {
            return Err(AuthError::DuplicateIdentity("username".into()));
        }
        state.next_user_id = id;

        let now = self.clock.now();
        let user = User {
            id,
            uuid: Uuid::now_v7(),
            username: Some(username),
            email: new.email,
            password_hash: new.password_hash,
            enabled: true,
            created_at: now,
            activated_at: new.activated.then_some(now),
            last_login_at: None,
            last_login_ip: None,
            last_auth_sensitive_operation_at: Some(now),
            profile: new.profile,
        };
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn update_password_hash(
        &self,
        user_id: i64,
        password_hash: &str,
    ) -> Result<(), AuthError> {
        let mut state = self.lock().await?;
        state.user_mut(user_id)?.password_hash = Some(password_hash.to_string());
        Ok(())
    }

    async fn set_enabled(&self, user_id: i64, enabled: bool) -> Result<User, AuthError> {
        let mut state = self.lock().await?;
        let user = state.user_mut(user_id)?;
        user.enabled = enabled;
        Ok(user.clone())
    }

    async fn update_profile(
        &self,
        user_id: i64,
        update: &(dyn for<'u> Fn(&'u mut User) + Send + Sync),
    ) -> Result<User, AuthError> {
        let mut state = self.lock().await?;
        let user = state.user_mut(user_id)?;
        let mut draft = user.clone();
        update(&mut draft);
        user.profile = draft.profile;
        Ok(user.clone())
    }

    async fn record_login(&self, user_id: i64, ip: Option<&str>) -> Result<LoginRecord, AuthError> {
        let now = self.clock.now();
        let mut state = self.lock().await?;
        let user = state.user_mut(user_id)?;
        let first_login = user.last_login_at.is_none();
        user.last_login_at = Some(now);
        user.last_login_ip = ip.map(str::to_string);
        Ok(LoginRecord {
            user: user.clone(),
            first_login,
        })
    }

    async fn replace_activation_token(
        &self,
        user_id: i64,
        code_hash: &str,
        ttl_seconds: i64,
    ) -> Result<DateTime<Utc>, AuthError> {
        let expires_at = expiry_after(self.clock.now(), ttl_seconds)?;
        let mut state = self.lock().await?;
        state.user_mut(user_id)?;
        state.drop_activation_of(user_id);
        state.activations.insert(
            code_hash.to_string(),
            TokenRecord {
                user_id,
                client_id: None,
                expires_at,
            },
        );
        state
            .activation_of_user
            .insert(user_id, code_hash.to_string());
        Ok(expires_at)
    }

    async fn find_user_by_activation_token(&self, code_hash: &str) -> Result<User, AuthError> {
        let state = self.lock().await?;
        let record = self.live_record(&state.activations, code_hash)?;
        state
            .users
            .get(&record.user_id)
            .cloned()
            .ok_or(AuthError::TokenNotFound)
    }

    async fn redeem_activation_token(
        &self,
        code_hash: &str,
        redemption: Redemption,
    ) -> Result<User, AuthError> {
        let now = self.clock.now();
        let mut state = self.lock().await?;
        let user_id = self.live_record(&state.activations, code_hash)?.user_id;
        state.drop_activation_of(user_id);
        state.activations.remove(code_hash);

        let user = state.user_mut(user_id)?;
        if user.activated_at.is_none() {
            user.activated_at = Some(now);
        }
        if let Redemption::PasswordReset { password_hash } = redemption {
            user.password_hash = Some(password_hash);
            user.last_auth_sensitive_operation_at = Some(now);
        }
        Ok(user.clone())
    }

    async fn replace_authorization_code(
        &self,
        user_id: i64,
        client_id: &str,
        code_hash: &str,
        ttl_seconds: i64,
    ) -> Result<DateTime<Utc>, AuthError> {
        let expires_at = expiry_after(self.clock.now(), ttl_seconds)?;
        let mut state = self.lock().await?;
        state.user_mut(user_id)?;
        state.drop_authorization_code_of(user_id);
        state.authorization_codes.insert(
            code_hash.to_string(),
            TokenRecord {
                user_id,
                client_id: Some(client_id.to_string()),
                expires_at,
            },
        );
        state
            .authorization_code_of_user
            .insert(user_id, code_hash.to_string());
        Ok(expires_at)
    }

    async fn redeem_authorization_code(
        &self,
        client_id: &str,
        code_hash: &str,
    ) -> Result<User, AuthError> {
        let mut state = self.lock().await?;
        let record = self.live_record(&state.authorization_codes, code_hash)?;
        if record.client_id.as_deref() != Some(client_id) {
            return Err(AuthError::TokenNotFound);
        }
        let user_id = record.user_id;
        state.drop_authorization_code_of(user_id);
        state.authorization_codes.remove(code_hash);
        state
            .users
            .get(&user_id)
            .cloned()
            .ok_or(AuthError::TokenNotFound)
    }

    async fn claim_federated_user(
        &self,
        email: &str,
        provider_id: &str,
    ) -> Result<FederatedClaim, AuthError> {
        let now = self.clock.now();
        let mut state = self.lock().await?;

        if let Some(existing) = state.email_owner(email).map(|u| u.id) {
            state.drop_activation_of(existing);
            let user = state.user_mut(existing)?;
            user.profile.first_login = false;
            if user.activated_at.is_none() {
                user.activated_at = Some(now);
            }
            return Ok(FederatedClaim {
                user: user.clone(),
                created: false,
            });
        }

        let id = state.next_user_id + 1;
        let username = generated_username(id);
        if state.username_taken(&username) {
            return Err(AuthError::DuplicateIdentity("username".into()));
        }
        state.next_user_id = id;
        let user = User {
            id,
            uuid: Uuid::now_v7(),
            username: Some(username),
            email: Some(email.to_string()),
            password_hash: None,
            enabled: true,
            created_at: now,
            activated_at: Some(now),
            last_login_at: None,
            last_login_ip: None,
            last_auth_sensitive_operation_at: Some(now),
            profile: UserProfile {
                registration_source: Some(provider_id.to_string()),
                first_login: true,
                ..UserProfile::default()
            },
        };
        state.users.insert(id, user.clone());
        Ok(FederatedClaim {
            user,
            created: true,
        })
    }

    async fn groups_for_user(&self, user_id: i64) -> Result<Vec<Group>, AuthError> {
        let state = self.lock().await?;
        let mut groups: Vec<Group> = state
            .memberships
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .filter_map(|(_, gid)| state.groups.get(gid).cloned())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn ensure_group(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Group, AuthError> {
        let now = self.clock.now();
        let mut state = self.lock().await?;
        if let Some(group) = state.group_by_name(name) {
            return Ok(group.clone());
        }
        Ok(state.insert_group(name, description, now))
    }

    async fn add_user_to_group(&self, user_id: i64, group_id: i64) -> Result<(), AuthError> {
        let mut state = self.lock().await?;
        state.user_mut(user_id)?;
        if !state.groups.contains_key(&group_id) {
            return Err(AuthError::Internal(format!("group {group_id} not found")));
        }
        state.memberships.insert((user_id, group_id));
        Ok(())
    }

    async fn bootstrap_admin(&self, user_id: i64) -> Result<bool, AuthError> {
        let now = self.clock.now();
        let mut state = self.lock().await?;
        if !state.groups.is_empty() {
            return Ok(false);
        }
        state.user_mut(user_id)?;
        let group = state.insert_group(ADMIN_GROUP_NAME, Some("Administrators"), now);
        state.memberships.insert((user_id, group.id));
        Ok(true)
    }

    async fn purge_expired_tokens(&self) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let mut state = self.lock().await?;
        let state = &mut *state;

        let expired: Vec<(String, i64)> = state
            .activations
            .iter()
            .filter(|(_, r)| r.expires_at < now)
            .map(|(h, r)| (h.clone(), r.user_id))
            .collect();
        for (hash, user_id) in &expired {
            state.activations.remove(hash);
            state.activation_of_user.remove(user_id);
        }

        let expired_codes: Vec<(String, i64)> = state
            .authorization_codes
            .iter()
            .filter(|(_, r)| r.expires_at < now)
            .map(|(h, r)| (h.clone(), r.user_id))
            .collect();
        for (hash, user_id) in &expired_codes {
            state.authorization_codes.remove(hash);
            state.authorization_code_of_user.remove(user_id);
        }

        Ok((expired.len() + expired_codes.len()) as u64)
    }
}
