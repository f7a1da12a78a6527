//! Google accounts.

use serde_json::Value;

use super::{ImportedProfile, ProviderProfileMapper, email_of, fill_full_name, pick};
use crate::auth::AuthError;
use crate::models::identity::User;

pub struct GoogleMapper;

impl ProviderProfileMapper for GoogleMapper {
    fn provider_id(&self) -> &str {
        "google"
    }

    /// Accepts both OpenID Connect claim names and the older profile names.
    /// The e-mail must be marked verified.
    fn import_profile(&self, raw: &Value) -> Result<ImportedProfile, AuthError> {
        let data = pick(
            raw,
            &[
                ("email", &["email"]),
                ("first_name", &["first_name", "given_name"]),
                ("last_name", &["last_name", "family_name"]),
                ("full_name", &["full_name", "name"]),
                ("locale", &["locale"]),
                ("picture", &["picture"]),
                ("email_verified", &["email_verified", "verified_email"]),
            ],
        );
        let verified = match data.get("email_verified") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        if !verified {
            return Err(AuthError::IncompleteProfile(
                "User account email is not verified.".into(),
            ));
        }
        Ok(ImportedProfile {
            email: email_of(&data),
            data,
        })
    }

    fn on_first_login(&self, user: &mut User, profile: &ImportedProfile) {
        fill_full_name(user, &profile.data, "full_name");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn maps_oidc_claims() {
        let raw = json!({
            "email": "ann@example.com",
            "given_name": "Ann",
            "family_name": "Lee",
            "name": "Ann Lee",
            "email_verified": true,
        });
        let profile = GoogleMapper.import_profile(&raw).unwrap();
        assert_eq!(profile.email.as_deref(), Some("ann@example.com"));
        assert_eq!(profile.data["first_name"], "Ann");
        assert_eq!(profile.data["full_name"], "Ann Lee");
        assert!(profile.data["locale"].is_null());
    }

    #[test]
    fn unverified_email_is_rejected() {
        let raw = json!({"email": "ann@example.com", "email_verified": false});
        assert!(matches!(
            GoogleMapper.import_profile(&raw),
            Err(AuthError::IncompleteProfile(_))
        ));
    }
}
