//! PostgreSQL repository tests.
//!
//! Skipped unless `WARDEN_TEST_DATABASE_URL` points at a disposable
//! database. Each test works with its own unique e-mail addresses so the
//! suite can run against a shared schema.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;
use warden_core::auth::AuthError;
use warden_core::auth::events::{EventBus, EventSink, RecordingEventSink};
use warden_core::auth::password::BcryptHasher;
use warden_core::federation::{FederationReconciler, MapperRegistry};
use warden_core::migrate::migrate;
use warden_core::models::identity::{User, UserAttributes};
use warden_core::store::postgres::{PgIdentityRepository, connect};
use warden_core::store::{CredentialStore, Redemption};

async fn store() -> Option<CredentialStore> {
    let Ok(url) = std::env::var("WARDEN_TEST_DATABASE_URL") else {
        eprintln!("WARDEN_TEST_DATABASE_URL not set, skipping");
        return None;
    };
    let pool = connect(&url, 8).await.expect("connect");
    migrate(&pool).await.expect("migrate");
    Some(CredentialStore::new(
        Arc::new(PgIdentityRepository::new(pool)),
        Arc::new(BcryptHasher::with_cost(4)),
    ))
}

fn unique_email() -> String {
    format!("pg-{}@example.com", Uuid::new_v4().simple())
}

fn attrs(email: &str) -> UserAttributes {
    UserAttributes {
        email: Some(email.to_string()),
        password: Some("secret".into()),
        registration_source: "email".into(),
        ..UserAttributes::default()
    }
}

#[tokio::test]
async fn pg_duplicate_email_and_generated_username() {
    let Some(store) = store().await else { return };
    let email = unique_email();
    let user = store.create_user(attrs(&email)).await.unwrap();
    assert_eq!(user.username, Some(format!("user-{}", user.id)));
    assert!(store.verify_password(&user, "secret").await);

    let err = store
        .create_user(attrs(&email.to_uppercase()))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::DuplicateIdentity(ref f) if f == "email"));

    let found = store.find_by_email(&email.to_uppercase()).await.unwrap();
    assert_eq!(found.map(|u| u.id), Some(user.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_activation_token_single_use_under_race() {
    let Some(store) = store().await else { return };
    let user = store.create_user(attrs(&unique_email())).await.unwrap();
    let issued = store.issue_activation_token(&user, 3600).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        let code = issued.code.clone();
        handles.push(tokio::spawn(async move {
            store
                .redeem_activation_token(&code, Redemption::Activate)
                .await
        }));
    }
    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    let user = store.find_by_id(user.id).await.unwrap().unwrap();
    assert!(user.is_activated());
}

#[tokio::test]
async fn pg_expired_token_is_reported_and_kept() {
    let Some(store) = store().await else { return };
    let user = store.create_user(attrs(&unique_email())).await.unwrap();
    // Negative lifetime puts expiry in the past.
    let issued = store.issue_activation_token(&user, -1).await.unwrap();
    assert!(matches!(
        store
            .redeem_activation_token(&issued.code, Redemption::Activate)
            .await,
        Err(AuthError::TokenExpired)
    ));
    assert!(matches!(
        store.lookup_activation_token(&issued.code).await,
        Err(AuthError::TokenExpired)
    ));
}

#[tokio::test]
async fn pg_authorization_code_bound_to_client() {
    let Some(store) = store().await else { return };
    let user = store.create_user(attrs(&unique_email())).await.unwrap();
    let issued = store
        .issue_authorization_code(&user, "web", 300)
        .await
        .unwrap();
    assert!(matches!(
        store.redeem_authorization_code("other", &issued.code).await,
        Err(AuthError::TokenNotFound)
    ));
    assert_eq!(
        store
            .redeem_authorization_code("web", &issued.code)
            .await
            .unwrap()
            .id,
        user.id
    );
    assert!(
        store
            .redeem_authorization_code("web", &issued.code)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn pg_federated_claim_is_create_then_fetch() {
    let Some(store) = store().await else { return };
    let email = unique_email();
    let first = store.claim_federated_user(&email, "google").await.unwrap();
    assert!(first.created);
    assert!(first.user.is_activated());
    assert!(first.user.profile.first_login);

    let second = store
        .claim_federated_user(&email.to_uppercase(), "facebook")
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.user.id, first.user.id);
    assert!(!second.user.profile.first_login);
    assert_eq!(
        second.user.profile.registration_source.as_deref(),
        Some("google")
    );
}

#[tokio::test]
async fn pg_login_record_reports_first_login() {
    let Some(store) = store().await else { return };
    let user = store.create_user(attrs(&unique_email())).await.unwrap();
    let ip = "192.0.2.1".parse().ok();
    assert!(store.record_login(&user, ip).await.unwrap().first_login);
    let again = store.record_login(&user, ip).await.unwrap();
    assert!(!again.first_login);
    assert_eq!(again.user.last_login_ip.as_deref(), Some("192.0.2.1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_concurrent_first_federated_logins_create_one_user() {
    let Some(store) = store().await else { return };
    let recorder = Arc::new(RecordingEventSink::new());
    let federation = FederationReconciler::new(
        store,
        EventBus::new(vec![recorder.clone() as Arc<dyn EventSink>]),
        MapperRegistry::with_defaults(),
    );
    let email = unique_email();
    let payload = json!({"email": email, "name": "Pat", "email_verified": true});

    let mut handles = Vec::new();
    for _ in 0..8 {
        let federation = federation.clone();
        let payload = payload.clone();
        handles.push(tokio::spawn(async move {
            federation.reconcile("google", &payload).await
        }));
    }
    let mut ids = BTreeSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap().id);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(recorder.kinds(), vec!["user_created"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_concurrent_profile_updates_keep_every_key() {
    let Some(store) = store().await else { return };
    let user = store.create_user(attrs(&unique_email())).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            let data = json!({"n": i});
            let provider = format!("p{i}");
            store
                .update_profile(&user, &|u: &mut User| {
                    if let Some(data) = data.as_object() {
                        u.profile.merge_social(&provider, data);
                    }
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let stored = store.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.profile.social.len(), 8);
}
