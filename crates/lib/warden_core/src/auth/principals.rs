//! Principal derivation for bearer tokens.

use crate::config::AuthPolicy;
use crate::models::identity::{ADMIN_GROUP_NAME, Group, User};

pub const AUTHENTICATED: &str = "authenticated";
pub const SUPERUSER: &str = "superuser:superuser";

/// `group:<name>`
pub fn group_principal(name: &str) -> String {
    format!("group:{name}")
}

/// `user:<id>`
pub fn user_principal(user_id: i64) -> String {
    format!("user:{user_id}")
}

/// Whether `groups` contains the admin group.
pub fn is_admin(groups: &[Group]) -> bool {
    groups.iter().any(|g| g.name == ADMIN_GROUP_NAME)
}

/// Principal set for `user`, in the order `authenticated`, groups,
/// `user:<id>`, then `superuser:superuser` when granted.
pub fn derive_principals(user: &User, groups: &[Group], policy: &AuthPolicy) -> Vec<String> {
    let mut principals = Vec::with_capacity(groups.len() + 3);
    principals.push(AUTHENTICATED.to_string());
    principals.extend(groups.iter().map(|g| group_principal(&g.name)));
    principals.push(user_principal(user.id));

    let listed = [user.username.as_deref(), user.email.as_deref()]
        .into_iter()
        .flatten()
        .any(|identifier| policy.is_listed_superuser(identifier));
    if listed || (policy.admin_as_superuser && is_admin(groups)) {
        principals.push(SUPERUSER.to_string());
    }
    principals
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::models::identity::UserProfile;

    fn user() -> User {
        User {
            id: 5,
            uuid: Uuid::new_v4(),
            username: Some("carlos".into()),
            email: Some("carlos@example.com".into()),
            password_hash: None,
            enabled: true,
            created_at: Utc::now(),
            activated_at: Some(Utc::now()),
            last_login_at: None,
            last_login_ip: None,
            last_auth_sensitive_operation_at: None,
            profile: UserProfile::default(),
        }
    }

    fn group(name: &str) -> Group {
        Group {
            id: 1,
            uuid: Uuid::new_v4(),
            name: name.into(),
            description: None,
            created_at: Utc::now(),
            data: Default::default(),
        }
    }

    #[test]
    fn plain_user_gets_base_principals() {
        let principals = derive_principals(&user(), &[], &AuthPolicy::default());
        assert_eq!(principals, vec!["authenticated", "user:5"]);
    }

    #[test]
    fn admin_group_implies_superuser_only_when_enabled() {
        let groups = [group("admin")];
        let off = derive_principals(&user(), &groups, &AuthPolicy::default());
        assert!(!off.contains(&SUPERUSER.to_string()));

        let policy = AuthPolicy {
            admin_as_superuser: true,
            ..AuthPolicy::default()
        };
        let on = derive_principals(&user(), &groups, &policy);
        assert_eq!(
            on,
            vec![
                "authenticated",
                "group:admin",
                "user:5",
                "superuser:superuser"
            ]
        );
    }

    #[test]
    fn listed_email_is_superuser() {
        let policy = AuthPolicy {
            superusers: vec!["Carlos@Example.com".into()],
            ..AuthPolicy::default()
        };
        let principals = derive_principals(&user(), &[group("staff")], &policy);
        assert_eq!(
            principals,
            vec!["authenticated", "group:staff", "user:5", "superuser:superuser"]
        );
    }
}
