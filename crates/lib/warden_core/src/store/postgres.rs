//! PostgreSQL identity repository.
//!
//! Each trait method runs in a single transaction. Expiry uses the
//! transaction's `now()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use super::{IdentityRepository, Redemption};
use crate::auth::AuthError;
use crate::models::identity::{
    ADMIN_GROUP_NAME, FederatedClaim, Group, LoginRecord, NewUser, User, UserProfile,
};

const USER_COLUMNS: &str = "id, uuid, username, email, password_hash, enabled, created_at, \
     activated_at, last_login_at, last_login_ip, last_auth_sensitive_operation_at, user_data";

const GROUP_COLUMNS: &str = "g.id, g.uuid, g.name, g.description, g.created_at, g.group_data";

#[derive(FromRow)]
struct UserRow {
    id: i64,
    uuid: Uuid,
    username: Option<String>,
    email: Option<String>,
    password_hash: Option<String>,
    enabled: bool,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
    last_login_at: Option<DateTime<Utc>>,
    last_login_ip: Option<String>,
    last_auth_sensitive_operation_at: Option<DateTime<Utc>>,
    user_data: Json<UserProfile>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            uuid: row.uuid,
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            enabled: row.enabled,
            created_at: row.created_at,
            activated_at: row.activated_at,
            last_login_at: row.last_login_at,
            last_login_ip: row.last_login_ip,
            last_auth_sensitive_operation_at: row.last_auth_sensitive_operation_at,
            profile: row.user_data.0,
        }
    }
}

#[derive(FromRow)]
struct GroupRow {
    id: i64,
    uuid: Uuid,
    name: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    group_data: Json<Map<String, Value>>,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Group {
            id: row.id,
            uuid: row.uuid,
            name: row.name,
            description: row.description,
            created_at: row.created_at,
            data: row.group_data.0,
        }
    }
}

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Map a unique violation on the user table to `DuplicateIdentity`.
fn map_insert_error(err: sqlx::Error) -> AuthError {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        let field = match db.constraint() {
            Some(c) if c.contains("email") => "email",
            _ => "username",
        };
        return AuthError::DuplicateIdentity(field.to_string());
    }
    AuthError::StoreUnavailable(err)
}

fn user_not_found(user_id: i64) -> AuthError {
    AuthError::Internal(format!("user {user_id} not found"))
}

/// Identity repository over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgIdentityRepository {
    pool: PgPool,
}

impl PgIdentityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_user(
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
    ) -> Result<User, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(User::from).ok_or_else(|| user_not_found(user_id))
    }

    /// Fill a missing username with `user-<id>`.
    async fn assign_generated_username(
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
    ) -> Result<(), AuthError> {
        sqlx::query("UPDATE users SET username = 'user-' || id WHERE id = $1 AND username IS NULL")
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .map_err(map_insert_error)?;
        Ok(())
    }

    /// Lock a token row by digest and report
    /// `(token_id, user_id, expired, client_id)`.
    async fn lock_token(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        link_column: &str,
        code_hash: &str,
    ) -> Result<(i64, i64, bool, Option<String>), AuthError> {
        let client_column = if table == "user_authorization_codes" {
            "t.client_id"
        } else {
            "NULL::text"
        };
        let row = sqlx::query_as::<_, (i64, i64, bool, Option<String>)>(&format!(
            "SELECT t.id, u.id, t.expires_at < now(), {client_column} \
             FROM {table} t JOIN users u ON u.{link_column} = t.id \
             WHERE t.code_hash = $1 \
             FOR UPDATE OF t"
        ))
        .bind(code_hash)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or(AuthError::TokenNotFound)
    }
}

#[async_trait]
impl IdentityRepository for PgIdentityRepository {
    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(username) = lower($1)"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn insert_user(&self, new: NewUser) -> Result<User, AuthError> {
        let mut tx = self.pool.begin().await?;
        let user_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (uuid, username, email, password_hash, activated_at, user_data) \
             VALUES ($1, $2, $3, $4, CASE WHEN $5 THEN now() END, $6) \
             RETURNING id",
        )
        .bind(Uuid::now_v7())
        .bind(new.username.as_deref())
        .bind(new.email.as_deref())
        .bind(new.password_hash.as_deref())
        .bind(new.activated)
        .bind(Json(&new.profile))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_insert_error)?;
        Self::assign_generated_username(&mut tx, user_id).await?;
        let user = Self::fetch_user(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(user)
    }

    async fn update_password_hash(
        &self,
        user_id: i64,
        password_hash: &str,
    ) -> Result<(), AuthError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1",
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(user_not_found(user_id));
        }
        Ok(())
    }

    async fn set_enabled(&self, user_id: i64, enabled: bool) -> Result<User, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET enabled = $2, updated_at = now() WHERE id = $1 \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::from).ok_or_else(|| user_not_found(user_id))
    }

    async fn update_profile(
        &self,
        user_id: i64,
        update: &(dyn for<'u> Fn(&'u mut User) + Send + Sync),
    ) -> Result<User, AuthError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| user_not_found(user_id))?;
        let mut user = User::from(row);
        update(&mut user);
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET user_data = $2, updated_at = now() WHERE id = $1 \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(Json(&user.profile))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row.into())
    }

    async fn record_login(&self, user_id: i64, ip: Option<&str>) -> Result<LoginRecord, AuthError> {
        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT last_login_at FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| user_not_found(user_id))?;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET last_login_at = now(), last_login_ip = $2 WHERE id = $1 \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(ip)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(LoginRecord {
            user: row.into(),
            first_login: previous.is_none(),
        })
    }

    async fn replace_activation_token(
        &self,
        user_id: i64,
        code_hash: &str,
        ttl_seconds: i64,
    ) -> Result<DateTime<Utc>, AuthError> {
        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT activation_id FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| user_not_found(user_id))?;
        if let Some(previous) = previous {
            sqlx::query("DELETE FROM user_activations WHERE id = $1")
                .bind(previous)
                .execute(&mut *tx)
                .await?;
        }
        let (token_id, expires_at) = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            "INSERT INTO user_activations (code_hash, expires_at) \
             VALUES ($1, now() + make_interval(secs => $2)) \
             RETURNING id, expires_at",
        )
        .bind(code_hash)
        .bind(ttl_seconds as f64)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE users SET activation_id = $2 WHERE id = $1")
            .bind(user_id)
            .bind(token_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(expires_at)
    }

    async fn find_user_by_activation_token(&self, code_hash: &str) -> Result<User, AuthError> {
        let (user_id, expired) = sqlx::query_as::<_, (i64, bool)>(
            "SELECT u.id, a.expires_at < now() \
             FROM user_activations a JOIN users u ON u.activation_id = a.id \
             WHERE a.code_hash = $1",
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AuthError::TokenNotFound)?;
        if expired {
            return Err(AuthError::TokenExpired);
        }
        self.find_user_by_id(user_id)
            .await?
            .ok_or(AuthError::TokenNotFound)
    }

    async fn redeem_activation_token(
        &self,
        code_hash: &str,
        redemption: Redemption,
    ) -> Result<User, AuthError> {
        let mut tx = self.pool.begin().await?;
        let (token_id, user_id, expired, _) =
            Self::lock_token(&mut tx, "user_activations", "activation_id", code_hash).await?;
        if expired {
            return Err(AuthError::TokenExpired);
        }
        sqlx::query("DELETE FROM user_activations WHERE id = $1")
            .bind(token_id)
            .execute(&mut *tx)
            .await?;

        let row = match redemption {
            Redemption::Activate => {
                sqlx::query_as::<_, UserRow>(&format!(
                    "UPDATE users SET activated_at = COALESCE(activated_at, now()), \
                     updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
                ))
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?
            }
            Redemption::PasswordReset { password_hash } => {
                sqlx::query_as::<_, UserRow>(&format!(
                    "UPDATE users SET password_hash = $2, \
                     activated_at = COALESCE(activated_at, now()), \
                     last_auth_sensitive_operation_at = now(), updated_at = now() \
                     WHERE id = $1 RETURNING {USER_COLUMNS}"
                ))
                .bind(user_id)
                .bind(password_hash)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        Ok(row.into())
    }

    async fn replace_authorization_code(
        &self,
        user_id: i64,
        client_id: &str,
        code_hash: &str,
        ttl_seconds: i64,
    ) -> Result<DateTime<Utc>, AuthError> {
        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT authorization_code_id FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| user_not_found(user_id))?;
        if let Some(previous) = previous {
            sqlx::query("DELETE FROM user_authorization_codes WHERE id = $1")
                .bind(previous)
                .execute(&mut *tx)
                .await?;
        }
        let (code_id, expires_at) = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            "INSERT INTO user_authorization_codes (code_hash, client_id, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3)) \
             RETURNING id, expires_at",
        )
        .bind(code_hash)
        .bind(client_id)
        .bind(ttl_seconds as f64)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE users SET authorization_code_id = $2 WHERE id = $1")
            .bind(user_id)
            .bind(code_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(expires_at)
    }

    async fn redeem_authorization_code(
        &self,
        client_id: &str,
        code_hash: &str,
    ) -> Result<User, AuthError> {
        let mut tx = self.pool.begin().await?;
        let (code_id, user_id, expired, issued_to) = Self::lock_token(
            &mut tx,
            "user_authorization_codes",
            "authorization_code_id",
            code_hash,
        )
        .await?;
        if issued_to.as_deref() != Some(client_id) {
            return Err(AuthError::TokenNotFound);
        }
        if expired {
            return Err(AuthError::TokenExpired);
        }
        sqlx::query("DELETE FROM user_authorization_codes WHERE id = $1")
            .bind(code_id)
            .execute(&mut *tx)
            .await?;
        let user = Self::fetch_user(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(user)
    }

    async fn claim_federated_user(
        &self,
        email: &str,
        provider_id: &str,
    ) -> Result<FederatedClaim, AuthError> {
        let profile = UserProfile {
            registration_source: Some(provider_id.to_string()),
            first_login: true,
            ..UserProfile::default()
        };
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (uuid, email, activated_at, user_data) \
             VALUES ($1, $2, now(), $3) \
             ON CONFLICT ((lower(email))) DO NOTHING \
             RETURNING id",
        )
        .bind(Uuid::now_v7())
        .bind(email)
        .bind(Json(&profile))
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(user_id) = inserted {
            Self::assign_generated_username(&mut tx, user_id).await?;
            let user = Self::fetch_user(&mut tx, user_id).await?;
            tx.commit().await?;
            return Ok(FederatedClaim {
                user,
                created: true,
            });
        }

        let (user_id, activation_id) = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT id, activation_id FROM users WHERE lower(email) = lower($1) FOR UPDATE",
        )
        .bind(email)
        .fetch_one(&mut *tx)
        .await?;
        if let Some(activation_id) = activation_id {
            sqlx::query("DELETE FROM user_activations WHERE id = $1")
                .bind(activation_id)
                .execute(&mut *tx)
                .await?;
        }
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET \
             user_data = jsonb_set(user_data, '{{first_login}}', 'false'::jsonb), \
             activated_at = COALESCE(activated_at, now()), updated_at = now() \
             WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(FederatedClaim {
            user: row.into(),
            created: false,
        })
    }

    async fn groups_for_user(&self, user_id: i64) -> Result<Vec<Group>, AuthError> {
        let rows = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups g \
             JOIN user_groups ug ON ug.group_id = g.id \
             WHERE ug.user_id = $1 ORDER BY g.name"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Group::from).collect())
    }

    async fn ensure_group(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Group, AuthError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO groups (uuid, name, description) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(description)
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups g WHERE g.name = $1"
        ))
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row.into())
    }

    async fn add_user_to_group(&self, user_id: i64, group_id: i64) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO user_groups (user_id, group_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bootstrap_admin(&self, user_id: i64) -> Result<bool, AuthError> {
        let promoted = sqlx::query_scalar::<_, i64>(
            "WITH created AS ( \
                 INSERT INTO groups (uuid, name, description) \
                 SELECT $1, $2, 'Administrators' \
                 WHERE NOT EXISTS (SELECT 1 FROM groups) \
                 ON CONFLICT (name) DO NOTHING \
                 RETURNING id \
             ) \
             INSERT INTO user_groups (user_id, group_id) \
             SELECT $3, id FROM created \
             RETURNING group_id",
        )
        .bind(Uuid::now_v7())
        .bind(ADMIN_GROUP_NAME)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(promoted.is_some())
    }

    async fn purge_expired_tokens(&self) -> Result<u64, AuthError> {
        let mut tx = self.pool.begin().await?;
        let activations = sqlx::query("DELETE FROM user_activations WHERE expires_at < now()")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let codes = sqlx::query("DELETE FROM user_authorization_codes WHERE expires_at < now()")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(activations + codes)
    }
}
