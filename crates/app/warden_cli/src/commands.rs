//! Subcommands that talk to the database.

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tracing::info;
use warden_core::auth::events::AuthEvent;
use warden_core::auth::mail::TracingMailDispatcher;
use warden_core::auth::password::BcryptHasher;
use warden_core::auth::recovery::ResetOutcome;
use warden_core::authority::{Authority, AuthorityParts};
use warden_core::config::{AuthPolicy, JwtSettings};
use warden_core::federation::MapperRegistry;
use warden_core::models::auth::LoginContext;
use warden_core::models::identity::{ADMIN_GROUP_NAME, UserAttributes};
use warden_core::store::postgres::{PgIdentityRepository, connect};

use crate::cli::{Cli, Commands};
use crate::{Error, Result};

/// Registration source and login source for CLI-driven actions.
const SOURCE_CLI: &str = "cli";

fn build_authority(pool: PgPool) -> Result<Authority> {
    Ok(Authority::new(AuthorityParts {
        repository: Arc::new(PgIdentityRepository::new(pool)),
        hasher: Arc::new(BcryptHasher::new()),
        mailer: Arc::new(TracingMailDispatcher),
        extra_sinks: Vec::new(),
        mappers: MapperRegistry::with_defaults(),
        policy: AuthPolicy::from_env()?,
        jwt: JwtSettings::from_env()?,
    }))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn execute(args: &Cli, command: &Commands) -> Result<()> {
    let pool = connect(&args.database_url, args.max_connections).await?;

    if let Commands::Migrate = command {
        warden_core::migrate::migrate(&pool).await?;
        info!("migrations applied");
        return Ok(());
    }

    let authority = build_authority(pool)?;
    let store = authority.store();

    match command {
        Commands::CreateUser {
            email,
            username,
            password,
            admin,
        } => {
            let user = store
                .create_user(UserAttributes {
                    username: username.clone(),
                    email: Some(email.clone()),
                    password: password.clone(),
                    full_name: None,
                    registration_source: SOURCE_CLI.to_string(),
                    activated: true,
                })
                .await?;
            authority
                .events()
                .notify(AuthEvent::UserCreated { user: user.clone() })
                .await?;
            if *admin {
                let group = store
                    .ensure_group(ADMIN_GROUP_NAME, Some("Administrators"))
                    .await?;
                store.add_to_group(&user, &group).await?;
            }
            let groups: Vec<String> = store
                .membership(&user)
                .await?
                .into_iter()
                .map(|g| g.name)
                .collect();
            print_json(&json!({ "user": user, "groups": groups }))
        }
        Commands::SetEnabled { email, enabled } => {
            let user = store
                .find_by_email(email)
                .await?
                .ok_or_else(|| Error::Custom(format!("No user with email {email}")))?;
            let user = store.set_enabled(&user, *enabled).await?;
            print_json(&json!({ "user_id": user.id, "enabled": user.enabled }))
        }
        Commands::ForgotPassword { email } => {
            match authority.recovery().request_reset(email).await? {
                ResetOutcome::Issued { expires_in } => {
                    print_json(&json!({ "status": "issued", "expires_in": expires_in }))
                }
                ResetOutcome::Suppressed => print_json(&json!({ "status": "suppressed" })),
            }
        }
        Commands::ResetPassword { code, password } => {
            let user = authority.recovery().complete_reset(code, password).await?;
            print_json(&json!({ "user_id": user.id, "status": "password_reset" }))
        }
        Commands::Login {
            identifier,
            password,
        } => {
            let token = authority
                .session()
                .authenticate_credentials(identifier, password, &LoginContext::new(SOURCE_CLI))
                .await?;
            print_json(&serde_json::to_value(&token)?)
        }
        Commands::PurgeTokens => {
            let purged = store.purge_expired_tokens().await?;
            print_json(&json!({ "purged": purged }))
        }
        Commands::Migrate | Commands::Version => Ok(()),
    }
}
