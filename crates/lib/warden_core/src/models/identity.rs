//! Identity domain models: users, groups and issued tokens.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the group the first user is promoted into.
pub const ADMIN_GROUP_NAME: &str = "admin";

/// Prefix of usernames generated for users who never picked one.
pub const GENERATED_USERNAME_PREFIX: &str = "user-";

/// Free-form profile bag stored alongside the user row.
///
/// Known keys are typed; anything else a deployment stores is kept in
/// `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub full_name: Option<String>,
    /// How the account was created: `email`, `cli`, or a provider id.
    #[serde(default)]
    pub registration_source: Option<String>,
    #[serde(default = "default_first_login")]
    pub first_login: bool,
    /// Per-provider data, keyed by provider id.
    #[serde(default)]
    pub social: BTreeMap<String, Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_first_login() -> bool {
    true
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            full_name: None,
            registration_source: None,
            first_login: true,
            social: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl UserProfile {
    /// Merge provider data under `social.<provider_id>`.
    ///
    /// Existing keys absent from `data` are kept; `null` values in `data` do
    /// not overwrite stored values.
    pub fn merge_social(&mut self, provider_id: &str, data: &Map<String, Value>) {
        let entry = self.social.entry(provider_id.to_string()).or_default();
        for (key, value) in data {
            if value.is_null() {
                continue;
            }
            entry.insert(key.clone(), value.clone());
        }
    }
}

/// Identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Publicly exposable id.
    pub uuid: Uuid,
    pub username: Option<String>,
    pub email: Option<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    /// Bearer tokens issued before this instant are stale.
    pub last_auth_sensitive_operation_at: Option<DateTime<Utc>>,
    pub profile: UserProfile,
}

impl User {
    /// Has the user completed activation (email confirmation or first
    /// federated login).
    pub fn is_activated(&self) -> bool {
        self.activated_at.is_some()
    }

    pub fn can_login(&self) -> bool {
        self.enabled && self.is_activated()
    }

    /// The username given to users who never chose one.
    pub fn generate_username(&self) -> String {
        generated_username(self.id)
    }

    /// How the user is presented to themselves: full name, then a
    /// user-chosen username, then email.
    pub fn friendly_name(&self) -> String {
        if let Some(full_name) = self.profile.full_name.as_deref()
            && !full_name.is_empty()
        {
            return full_name.to_string();
        }
        match self.username.as_deref() {
            Some(username) if !username.starts_with(GENERATED_USERNAME_PREFIX) => {
                username.to_string()
            }
            _ => self.email.clone().unwrap_or_default(),
        }
    }

    /// Whether a credential issued at `issued_at` is still acceptable.
    ///
    /// Compared at microsecond precision, the resolution PostgreSQL stores.
    /// A token minted within the same microsecond as the sensitive operation
    /// is still accepted. Tokens that only carry a whole-second `iat` are
    /// truncated to the second and so are rejected for the rest of that
    /// second.
    pub fn is_valid_session(&self, issued_at: DateTime<Utc>) -> bool {
        match self.last_auth_sensitive_operation_at {
            Some(changed_at) => changed_at.timestamp_micros() <= issued_at.timestamp_micros(),
            None => true,
        }
    }
}

/// `user-<id>`.
pub fn generated_username(id: i64) -> String {
    format!("{GENERATED_USERNAME_PREFIX}{id}")
}

/// Named role bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Attributes accepted when creating a user. The password is plaintext and
/// is hashed by the credential store.
#[derive(Debug, Clone, Default)]
pub struct UserAttributes {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub full_name: Option<String>,
    pub registration_source: String,
    /// Create the user already activated.
    pub activated: bool,
}

/// Repository-level insert payload.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub activated: bool,
    pub profile: UserProfile,
}

/// A freshly issued single-use token. The plaintext `code` is only ever
/// available here.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub code: String,
    pub ttl_seconds: i64,
    pub expires_at: DateTime<Utc>,
}

/// Result of recording a login.
#[derive(Debug, Clone)]
pub struct LoginRecord {
    pub user: User,
    /// `last_login_at` was unset before this login.
    pub first_login: bool,
}

/// Result of the federated create-or-fetch.
#[derive(Debug, Clone)]
pub struct FederatedClaim {
    pub user: User,
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: i64) -> User {
        User {
            id,
            uuid: Uuid::new_v4(),
            username: Some(generated_username(id)),
            email: Some("carlos@example.com".into()),
            password_hash: None,
            enabled: true,
            created_at: Utc::now(),
            activated_at: None,
            last_login_at: None,
            last_login_ip: None,
            last_auth_sensitive_operation_at: None,
            profile: UserProfile::default(),
        }
    }

    #[test]
    fn can_login_requires_enabled_and_activated() {
        let mut u = user(1);
        assert!(!u.can_login());
        u.activated_at = Some(Utc::now());
        assert!(u.can_login());
        u.enabled = false;
        assert!(!u.can_login());
    }

    #[test]
    fn friendly_name_skips_generated_username() {
        let mut u = user(7);
        assert_eq!(u.friendly_name(), "carlos@example.com");
        u.username = Some("carlos".into());
        assert_eq!(u.friendly_name(), "carlos");
        u.profile.full_name = Some("Carlos Lopez".into());
        assert_eq!(u.friendly_name(), "Carlos Lopez");
    }

    #[test]
    fn generated_username_uses_id() {
        assert_eq!(user(42).generate_username(), "user-42");
    }

    #[test]
    fn session_is_stale_after_sensitive_operation() {
        let mut u = user(1);
        let issued = Utc::now();
        assert!(u.is_valid_session(issued));
        u.last_auth_sensitive_operation_at = Some(issued + chrono::Duration::seconds(5));
        assert!(!u.is_valid_session(issued));
        assert!(u.is_valid_session(issued + chrono::Duration::seconds(5)));
    }

    #[test]
    fn session_minted_earlier_in_the_same_second_is_stale() {
        let mut u = user(1);
        let changed_at = DateTime::from_timestamp_micros(1_700_000_000_600_000).unwrap();
        u.last_auth_sensitive_operation_at = Some(changed_at);

        let before = DateTime::from_timestamp_micros(1_700_000_000_200_000).unwrap();
        let after = DateTime::from_timestamp_micros(1_700_000_000_600_001).unwrap();
        assert!(!u.is_valid_session(before));
        assert!(u.is_valid_session(changed_at));
        assert!(u.is_valid_session(after));
    }

    #[test]
    fn merge_social_is_non_destructive() {
        let mut profile = UserProfile::default();
        let first = json!({"id": "1", "locale": "fi"});
        profile.merge_social("google", first.as_object().unwrap());
        let second = json!({"picture": "p.png", "locale": null});
        profile.merge_social("google", second.as_object().unwrap());

        let google = &profile.social["google"];
        assert_eq!(google["id"], "1");
        assert_eq!(google["locale"], "fi");
        assert_eq!(google["picture"], "p.png");
    }

    #[test]
    fn profile_keeps_unknown_keys() {
        let raw = json!({"full_name": "A", "first_login": false, "theme": "dark"});
        let profile: UserProfile = serde_json::from_value(raw).unwrap();
        assert!(!profile.first_login);
        assert_eq!(profile.extra["theme"], "dark");
        let back = serde_json::to_value(&profile).unwrap();
        assert_eq!(back["theme"], "dark");
    }

    #[test]
    fn empty_profile_defaults_to_first_login() {
        let profile: UserProfile = serde_json::from_value(json!({})).unwrap();
        assert!(profile.first_login);
        assert!(profile.social.is_empty());
    }
}
