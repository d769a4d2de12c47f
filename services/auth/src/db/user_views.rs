//! User read model storage.
//!
//! Rows of `users_view` are only ever written by the users projection. Every
//! write carries the event version so that redelivered or out-of-order events
//! cannot move a row backwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};

use super::DbError;

/// A denormalized user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserView {
    pub user_id: String,
    pub username: String,
    pub password_hash: String,
    /// Version of the last event applied to this row.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for UserView {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Outcome of a version-guarded row update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewUpdate {
    /// The row advanced to the new version.
    Applied,
    /// The row already holds this version or a newer one.
    Stale { stored_version: i32 },
    /// No row exists for the id yet.
    Missing,
}

/// Storage for the user read model.
#[async_trait]
pub trait UserViewStore: Send + Sync {
    /// Insert `view` unless a row for its id exists. Returns whether it inserted.
    async fn insert_if_absent(&self, view: &UserView) -> Result<bool, DbError>;

    /// Set the password hash if `version` is newer than the stored one.
    async fn apply_password_change(
        &self,
        user_id: &str,
        password_hash: &str,
        version: i32,
        at: DateTime<Utc>,
    ) -> Result<ViewUpdate, DbError>;

    async fn get(&self, user_id: &str) -> Result<Option<UserView>, DbError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<UserView>, DbError>;
}

/// Postgres-backed user read model.
#[derive(Clone)]
pub struct PgUserViews {
    pool: PgPool,
}

impl PgUserViews {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserViewStore for PgUserViews {
    async fn insert_if_absent(&self, view: &UserView) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO users_view (user_id, username, password_hash, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&view.user_id)
        .bind(&view.username)
        .bind(&view.password_hash)
        .bind(view.version)
        .bind(view.created_at)
        .bind(view.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    async fn apply_password_change(
        &self,
        user_id: &str,
        password_hash: &str,
        version: i32,
        at: DateTime<Utc>,
    ) -> Result<ViewUpdate, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE users_view
            SET password_hash = $2,
                version = $3,
                updated_at = $4
            WHERE user_id = $1 AND version < $3
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .bind(version)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 1 {
            return Ok(ViewUpdate::Applied);
        }

        let stored: Option<i32> =
            sqlx::query_scalar("SELECT version FROM users_view WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::Query)?;

        Ok(match stored {
            Some(stored_version) => ViewUpdate::Stale { stored_version },
            None => ViewUpdate::Missing,
        })
    }

    async fn get(&self, user_id: &str) -> Result<Option<UserView>, DbError> {
        sqlx::query_as::<_, UserView>(
            r#"
            SELECT user_id, username, password_hash, version, created_at, updated_at
            FROM users_view
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserView>, DbError> {
        sqlx::query_as::<_, UserView>(
            r#"
            SELECT user_id, username, password_hash, version, created_at, updated_at
            FROM users_view
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}
