//! Twitter accounts. The payload is stored as-is.

use serde_json::Value;

use super::{ImportedProfile, ProviderProfileMapper, email_of, fill_full_name};
use crate::auth::AuthError;
use crate::models::identity::User;

pub struct TwitterMapper;

impl ProviderProfileMapper for TwitterMapper {
    fn provider_id(&self) -> &str {
        "twitter"
    }

    fn import_profile(&self, raw: &Value) -> Result<ImportedProfile, AuthError> {
        let data = raw.as_object().cloned().ok_or_else(|| {
            AuthError::IncompleteProfile("Twitter profile is not an object.".into())
        })?;
        Ok(ImportedProfile {
            email: email_of(&data),
            data,
        })
    }

    fn on_first_login(&self, user: &mut User, profile: &ImportedProfile) {
        fill_full_name(user, &profile.data, "name");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn passes_payload_through() {
        let raw = json!({"screen_name": "dee", "email": "dee@example.com", "lang": "en"});
        let profile = TwitterMapper.import_profile(&raw).unwrap();
        assert_eq!(profile.email.as_deref(), Some("dee@example.com"));
        assert_eq!(profile.data.len(), 3);
        assert_eq!(profile.data["screen_name"], "dee");
    }

    #[test]
    fn non_object_payload_is_incomplete() {
        assert!(TwitterMapper.import_profile(&json!("nope")).is_err());
    }
}
