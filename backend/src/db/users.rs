// User and refresh-token persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vaulthalla_core::types::UserId;
use vaulthalla_core::Result;
use vaulthalla_store::model::{NewUser, RefreshTokenRecord, User};
use vaulthalla_store::{TokenStore, UserStore};

use super::{db_err, PgStore};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i32,
    name: String,
    email: String,
    password_hash: String,
    role_id: i32,
    is_active: bool,
    created_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id as u32,
            name: row.name,
            email: row.email,
            password_hash: row.password_hash,
            role_id: row.role_id as u32,
            is_active: row.is_active,
            created_at: row.created_at,
            last_login_at: row.last_login_at,
        }
    }
}

const USER_COLUMNS: &str =
    "id, name, email, password_hash, role_id, is_active, created_at, last_login_at";

#[async_trait]
impl UserStore for PgStore {
    async fn create_user(&self, draft: NewUser) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (name, email, password_hash, role_id) \
             VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&draft.name)
        .bind(&draft.email)
        .bind(&draft.password_hash)
        .bind(draft.role_id as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("create user", e))?;
        Ok(row.into())
    }

    async fn user_by_id(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch user", e))?;
        Ok(row.map(Into::into))
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch user by email", e))?;
        Ok(row.map(Into::into))
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "UPDATE users SET name = $2, email = $3, role_id = $4, is_active = $5 WHERE id = $1",
        )
        .bind(user.id as i32)
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.role_id as i32)
        .bind(user.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("update user", e))?;
        Ok(())
    }

    async fn update_password_hash(&self, id: UserId, hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(id as i32)
            .bind(hash)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("update password hash", e))?;
        Ok(())
    }

    async fn update_last_login(&self, id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET last_login_at = NOW() WHERE id = $1")
            .bind(id as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("update last login", e))?;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list users", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    jti: String,
    user_id: i32,
    hashed_token: String,
    ip: String,
    user_agent: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked: bool,
}

impl From<TokenRow> for RefreshTokenRecord {
    fn from(row: TokenRow) -> Self {
        RefreshTokenRecord {
            jti: row.jti,
            user_id: row.user_id as u32,
            hashed_token: row.hashed_token,
            ip: row.ip,
            user_agent: row.user_agent,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            revoked: row.revoked,
        }
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn add_refresh_token(&self, record: RefreshTokenRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO refresh_tokens (jti, user_id, hashed_token, ip, user_agent, issued_at, expires_at, revoked) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (jti) DO UPDATE SET user_id = EXCLUDED.user_id",
        )
        .bind(&record.jti)
        .bind(record.user_id as i32)
        .bind(&record.hashed_token)
        .bind(&record.ip)
        .bind(&record.user_agent)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .bind(record.revoked)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("add refresh token", e))?;
        Ok(())
    }

    async fn refresh_token(&self, jti: &str) -> Result<Option<RefreshTokenRecord>> {
        let row = sqlx::query_as::<_, TokenRow>(
            "SELECT jti, user_id, hashed_token, ip, user_agent, issued_at, expires_at, revoked \
             FROM refresh_tokens WHERE jti = $1",
        )
        .bind(jti)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch refresh token", e))?;
        Ok(row.map(Into::into))
    }

    async fn revoke_all_refresh_tokens(&self, user_id: UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1 AND NOT revoked",
        )
        .bind(user_id as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("revoke refresh tokens", e))?;
        Ok(result.rows_affected())
    }

    async fn revoke_refresh_token(&self, jti: &str) -> Result<()> {
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE jti = $1")
            .bind(jti)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("revoke refresh token", e))?;
        Ok(())
    }

    async fn purge_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE revoked OR expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("purge refresh tokens", e))?;
        Ok(result.rows_affected())
    }
}
