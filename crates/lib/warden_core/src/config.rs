//! Authentication policy and bearer signing configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::jwt::resolve_jwt_secret;

/// Prefix of every environment variable read by [`AuthPolicy::from_env`].
pub const ENV_PREFIX: &str = "WARDEN_";

/// Activation / password reset token lifetime: 24 hours.
pub const DEFAULT_ACTIVATION_TOKEN_EXPIRY_SECS: i64 = 24 * 3600;

/// Authorization code lifetime: 5 minutes.
pub const DEFAULT_AUTHORIZATION_CODE_EXPIRY_SECS: i64 = 5 * 60;

/// Access token lifetime: 15 minutes.
pub const DEFAULT_ACCESS_TOKEN_EXPIRY_SECS: i64 = 15 * 60;

/// Upper bound for every configured lifetime: ten years.
pub const MAX_EXPIRY_SECS: i64 = 10 * 365 * 86400;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Policy switches consumed by the session, sign-up and recovery services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthPolicy {
    pub activation_token_expiry_seconds: i64,
    pub require_activation: bool,
    pub allow_inactive_login: bool,
    pub allow_email_auth: bool,
    /// Log the user in right after sign-up.
    pub autologin: bool,
    pub login_after_activation: bool,
    /// Usernames or emails that always get `superuser:superuser`.
    pub superusers: Vec<String>,
    pub admin_as_superuser: bool,
    pub authorization_code_expiry_seconds: i64,
    /// Registered authorization-code clients: `client_id → redirect_uri`.
    pub authorization_clients: BTreeMap<String, String>,
    /// Base of the link mailed after sign-up; the code is appended as a path
    /// segment.
    pub activation_url: String,
    /// Base of the link mailed for password reset.
    pub reset_password_url: String,
    /// Answer password reset requests identically whether or not the email
    /// belongs to a user who may reset.
    pub uniform_reset_response: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            activation_token_expiry_seconds: DEFAULT_ACTIVATION_TOKEN_EXPIRY_SECS,
            require_activation: true,
            allow_inactive_login: false,
            allow_email_auth: true,
            autologin: false,
            login_after_activation: false,
            superusers: Vec::new(),
            admin_as_superuser: false,
            authorization_code_expiry_seconds: DEFAULT_AUTHORIZATION_CODE_EXPIRY_SECS,
            authorization_clients: BTreeMap::new(),
            activation_url: "http://localhost:8521/activate".into(),
            reset_password_url: "http://localhost:8521/reset-password".into(),
            uniform_reset_response: true,
        }
    }
}

impl AuthPolicy {
    /// Reads the policy from environment variables, falling back to the
    /// defaults.
    ///
    /// | Variable                                   | Default |
    /// |--------------------------------------------|---------|
    /// | `WARDEN_ACTIVATION_TOKEN_EXPIRY_SECONDS`   | `86400` |
    /// | `WARDEN_REQUIRE_ACTIVATION`                | `true`  |
    /// | `WARDEN_ALLOW_INACTIVE_LOGIN`              | `false` |
    /// | `WARDEN_ALLOW_EMAIL_AUTH`                  | `true`  |
    /// | `WARDEN_AUTOLOGIN`                         | `false` |
    /// | `WARDEN_LOGIN_AFTER_ACTIVATION`            | `false` |
    /// | `WARDEN_SUPERUSERS` (comma separated)      | empty   |
    /// | `WARDEN_ADMIN_AS_SUPERUSER`                | `false` |
    /// | `WARDEN_AUTHORIZATION_CODE_EXPIRY_SECONDS` | `300`   |
    /// | `WARDEN_AUTHORIZATION_CLIENTS` (`id=uri,…`) | empty  |
    /// | `WARDEN_ACTIVATION_URL`                    | local   |
    /// | `WARDEN_RESET_PASSWORD_URL`                | local   |
    /// | `WARDEN_UNIFORM_RESET_RESPONSE`            | `true`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AuthPolicy::from_env`] but reads through `lookup`, which
    /// receives the full variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = PrefixedLookup { lookup };
        let defaults = Self::default();
        Ok(Self {
            activation_token_expiry_seconds: env.int(
                "ACTIVATION_TOKEN_EXPIRY_SECONDS",
                defaults.activation_token_expiry_seconds,
            )?,
            require_activation: env.flag("REQUIRE_ACTIVATION", defaults.require_activation)?,
            allow_inactive_login: env
                .flag("ALLOW_INACTIVE_LOGIN", defaults.allow_inactive_login)?,
            allow_email_auth: env.flag("ALLOW_EMAIL_AUTH", defaults.allow_email_auth)?,
            autologin: env.flag("AUTOLOGIN", defaults.autologin)?,
            login_after_activation: env
                .flag("LOGIN_AFTER_ACTIVATION", defaults.login_after_activation)?,
            superusers: env.list("SUPERUSERS"),
            admin_as_superuser: env.flag("ADMIN_AS_SUPERUSER", defaults.admin_as_superuser)?,
            authorization_code_expiry_seconds: env.int(
                "AUTHORIZATION_CODE_EXPIRY_SECONDS",
                defaults.authorization_code_expiry_seconds,
            )?,
            authorization_clients: env.pairs("AUTHORIZATION_CLIENTS")?,
            activation_url: env.string("ACTIVATION_URL", defaults.activation_url),
            reset_password_url: env.string("RESET_PASSWORD_URL", defaults.reset_password_url),
            uniform_reset_response: env
                .flag("UNIFORM_RESET_RESPONSE", defaults.uniform_reset_response)?,
        })
    }

    /// Whether `identifier` (username or email) is on the superuser list.
    /// Emails compare case-insensitively.
    pub fn is_listed_superuser(&self, identifier: &str) -> bool {
        self.superusers
            .iter()
            .any(|s| s == identifier || (s.contains('@') && s.eq_ignore_ascii_case(identifier)))
    }
}

/// Bearer token signing settings.
#[derive(Clone, Debug)]
pub struct JwtSettings {
    /// HS256 signing secret.
    pub secret: String,
    pub audience: String,
    pub access_token_expiry_seconds: i64,
}

impl JwtSettings {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            audience: "localhost".into(),
            access_token_expiry_seconds: DEFAULT_ACCESS_TOKEN_EXPIRY_SECS,
        }
    }

    /// Reads signing settings from the environment.
    ///
    /// | Variable                              | Default                          |
    /// |---------------------------------------|----------------------------------|
    /// | `JWT_SECRET` / `AUTH_SECRET`          | generated & persisted to file    |
    /// | `WARDEN_JWT_AUDIENCE`                 | `localhost`                      |
    /// | `WARDEN_ACCESS_TOKEN_EXPIRY_SECONDS`  | `900`                            |
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = PrefixedLookup {
            lookup: |key: &str| std::env::var(key).ok(),
        };
        Ok(Self {
            secret: resolve_jwt_secret(),
            audience: env.string("JWT_AUDIENCE", "localhost".into()),
            access_token_expiry_seconds: env.int(
                "ACCESS_TOKEN_EXPIRY_SECONDS",
                DEFAULT_ACCESS_TOKEN_EXPIRY_SECS,
            )?,
        })
    }
}

struct PrefixedLookup<F> {
    lookup: F,
}

impl<F> PrefixedLookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<(String, String)> {
        let name = format!("{ENV_PREFIX}{key}");
        let value = (self.lookup)(&name)?;
        let value = value.trim().to_string();
        if value.is_empty() {
            return None;
        }
        Some((name, value))
    }

    fn string(&self, key: &str, default: String) -> String {
        self.raw(key).map(|(_, v)| v).unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some((name, value)) => parse_flag(&value).ok_or(ConfigError::Invalid {
                key: name,
                value,
            }),
        }
    }

    /// A lifetime in seconds, between 1 and [`MAX_EXPIRY_SECS`].
    fn int(&self, key: &str, default: i64) -> Result<i64, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some((name, value)) => match value.parse::<i64>() {
                Ok(n) if n > 0 && n <= MAX_EXPIRY_SECS => Ok(n),
                _ => Err(ConfigError::Invalid { key: name, value }),
            },
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.raw(key)
            .map(|(_, v)| {
                v.split([',', ' ', '\n'])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn pairs(&self, key: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        let Some((name, value)) = self.raw(key) else {
            return Ok(BTreeMap::new());
        };
        let mut out = BTreeMap::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (id, uri) = item.split_once('=').ok_or_else(|| ConfigError::Invalid {
                key: name.clone(),
                value: item.to_string(),
            })?;
            out.insert(id.trim().to_string(), uri.trim().to_string());
        }
        Ok(out)
    }
}

/// Accepts the usual truthy/falsy spellings.
fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let policy = AuthPolicy::from_lookup(lookup(&[])).unwrap();
        assert_eq!(policy, AuthPolicy::default());
        assert_eq!(policy.activation_token_expiry_seconds, 86400);
        assert!(policy.require_activation);
        assert!(!policy.allow_inactive_login);
        assert!(policy.allow_email_auth);
        assert!(!policy.autologin);
        assert!(!policy.login_after_activation);
        assert!(policy.superusers.is_empty());
        assert!(!policy.admin_as_superuser);
    }

    #[test]
    fn reads_prefixed_variables() {
        let policy = AuthPolicy::from_lookup(lookup(&[
            ("WARDEN_REQUIRE_ACTIVATION", "no"),
            ("WARDEN_ADMIN_AS_SUPERUSER", "1"),
            ("WARDEN_SUPERUSERS", "root, Boss@Example.com"),
            ("WARDEN_ACTIVATION_TOKEN_EXPIRY_SECONDS", "3600"),
            ("WARDEN_AUTHORIZATION_CLIENTS", "web=https://a/cb, cli=http://b"),
        ]))
        .unwrap();
        assert!(!policy.require_activation);
        assert!(policy.admin_as_superuser);
        assert_eq!(policy.superusers, vec!["root", "Boss@Example.com"]);
        assert_eq!(policy.activation_token_expiry_seconds, 3600);
        assert_eq!(policy.authorization_clients["web"], "https://a/cb");
        assert_eq!(policy.authorization_clients["cli"], "http://b");
    }

    #[test]
    fn rejects_garbage_flag() {
        let err = AuthPolicy::from_lookup(lookup(&[("WARDEN_AUTOLOGIN", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("WARDEN_AUTOLOGIN"));
    }

    #[test]
    fn rejects_non_positive_ttl() {
        assert!(
            AuthPolicy::from_lookup(lookup(&[("WARDEN_ACTIVATION_TOKEN_EXPIRY_SECONDS", "0")]))
                .is_err()
        );
    }

    #[test]
    fn rejects_ttl_beyond_ten_years() {
        let err = AuthPolicy::from_lookup(lookup(&[(
            "WARDEN_ACTIVATION_TOKEN_EXPIRY_SECONDS",
            "9000000000000000",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("WARDEN_ACTIVATION_TOKEN_EXPIRY_SECONDS"));

        let max = MAX_EXPIRY_SECS.to_string();
        let policy = AuthPolicy::from_lookup(lookup(&[(
            "WARDEN_AUTHORIZATION_CODE_EXPIRY_SECONDS",
            max.as_str(),
        )]))
        .unwrap();
        assert_eq!(policy.authorization_code_expiry_seconds, MAX_EXPIRY_SECS);
        let over = (MAX_EXPIRY_SECS + 1).to_string();
        assert!(
            AuthPolicy::from_lookup(lookup(&[(
                "WARDEN_AUTHORIZATION_CODE_EXPIRY_SECONDS",
                over.as_str(),
            )]))
            .is_err()
        );
    }

    #[test]
    fn superuser_list_matches_username_exactly_and_email_loosely() {
        let policy = AuthPolicy {
            superusers: vec!["root".into(), "boss@example.com".into()],
            ..AuthPolicy::default()
        };
        assert!(policy.is_listed_superuser("root"));
        assert!(!policy.is_listed_superuser("Root"));
        assert!(policy.is_listed_superuser("Boss@Example.com"));
        assert!(!policy.is_listed_superuser("someone"));
    }
}
