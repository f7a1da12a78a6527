//! Facebook accounts.

use serde_json::Value;

use super::{ImportedProfile, ProviderProfileMapper, email_of, fill_full_name, pick};
use crate::auth::AuthError;
use crate::models::identity::User;

pub struct FacebookMapper;

impl ProviderProfileMapper for FacebookMapper {
    fn provider_id(&self) -> &str {
        "facebook"
    }

    fn import_profile(&self, raw: &Value) -> Result<ImportedProfile, AuthError> {
        let data = pick(
            raw,
            &[
                ("id", &["id"]),
                ("email", &["email"]),
                ("first_name", &["first_name"]),
                ("last_name", &["last_name"]),
                ("full_name", &["full_name", "name"]),
                ("nickname", &["nickname"]),
                ("gender", &["gender"]),
                ("link", &["link"]),
                ("timezone", &["timezone"]),
                ("country", &["country"]),
                ("city", &["city"]),
                ("postal_code", &["postal_code"]),
                ("birth_date", &["birth_date", "birthday"]),
            ],
        );
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
    fn missing_email_yields_no_email() {
        let profile = FacebookMapper
            .import_profile(&json!({"id": "10", "name": "Bob"}))
            .unwrap();
        assert!(profile.email.is_none());
        assert_eq!(profile.data["full_name"], "Bob");
    }
}
