use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlpilot_shared::User;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;

/// Durable user record, password hash included. Only `public()` views leave
/// the server.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub is_default_avatar: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn public(&self) -> User {
        User {
            id: self.id,
            username: self.username.clone(),
            avatar_url: self.avatar_url.clone(),
            is_default_avatar: self.is_default_avatar,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub is_default_avatar: bool,
}

/// Explicit partial update. The raw password never appears here; callers
/// hash before reaching the store.
#[derive(Debug, Default)]
pub struct UserPatch {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub is_default_avatar: Option<bool>,
    pub password_hash: Option<String>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<UserRecord>, AppError>;
    async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>, AppError>;
    /// Fails with Conflict if the username is already taken; the backing
    /// store's unique constraint is the final arbiter under races.
    async fn create(&self, new: NewUser) -> Result<UserRecord, AppError>;
    async fn update(&self, id: Uuid, patch: UserPatch) -> Result<UserRecord, AppError>;
}

pub struct PgUserStore {
    pool: DbPool,
}

impl PgUserStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

type UserRow = (
    Uuid,
    String,
    String,
    String,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn row_to_record(row: UserRow) -> UserRecord {
    let (id, username, password_hash, avatar_url, is_default_avatar, created_at, updated_at) = row;
    UserRecord {
        id,
        username,
        password_hash,
        avatar_url,
        is_default_avatar,
        created_at,
        updated_at,
    }
}

/// Postgres signals a lost uniqueness race on `users.username` with error
/// code 23505; surface it as the same Conflict the pre-check produces.
fn map_insert_error(e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return AppError::Conflict("Username already exists".to_string());
        }
    }
    AppError::Database(e)
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get(&self, id: Uuid) -> Result<Option<UserRecord>, AppError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, password_hash, avatar_url, is_default_avatar, created_at, updated_at
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_record))
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>, AppError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, password_hash, avatar_url, is_default_avatar, created_at, updated_at
             FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_record))
    }

    async fn create(&self, new: NewUser) -> Result<UserRecord, AppError> {
        let row: UserRow = sqlx::query_as(
            r#"
            INSERT INTO users (id, username, password_hash, avatar_url, is_default_avatar)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, username, password_hash, avatar_url, is_default_avatar, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.username)
        .bind(&new.password_hash)
        .bind(&new.avatar_url)
        .bind(new.is_default_avatar)
        .fetch_one(&self.pool)
        .await
        .map_err(map_insert_error)?;

        Ok(row_to_record(row))
    }

    async fn update(&self, id: Uuid, patch: UserPatch) -> Result<UserRecord, AppError> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            UPDATE users SET
                username = COALESCE($2, username),
                avatar_url = COALESCE($3, avatar_url),
                is_default_avatar = COALESCE($4, is_default_avatar),
                password_hash = COALESCE($5, password_hash),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, username, password_hash, avatar_url, is_default_avatar, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(patch.username)
        .bind(patch.avatar_url)
        .bind(patch.is_default_avatar)
        .bind(patch.password_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_insert_error)?;

        row.map(row_to_record).ok_or(AppError::NotFound)
    }
}

#[cfg(test)]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory store with the same uniqueness semantics as the Postgres
    /// schema, for engine tests.
    #[derive(Default)]
    pub struct MemoryUserStore {
        users: Mutex<HashMap<Uuid, UserRecord>>,
    }

    #[async_trait]
    impl UserStore for MemoryUserStore {
        async fn get(&self, id: Uuid) -> Result<Option<UserRecord>, AppError> {
            Ok(self.users.lock().unwrap().get(&id).cloned())
        }

        async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>, AppError> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .values()
                .find(|u| u.username == username)
                .cloned())
        }

        async fn create(&self, new: NewUser) -> Result<UserRecord, AppError> {
            let mut users = self.users.lock().unwrap();
            if users.values().any(|u| u.username == new.username) {
                return Err(AppError::Conflict("Username already exists".to_string()));
            }

            let now = Utc::now();
            let record = UserRecord {
                id: Uuid::new_v4(),
                username: new.username,
                password_hash: new.password_hash,
                avatar_url: new.avatar_url,
                is_default_avatar: new.is_default_avatar,
                created_at: now,
                updated_at: now,
            };
            users.insert(record.id, record.clone());
            Ok(record)
        }

        async fn update(&self, id: Uuid, patch: UserPatch) -> Result<UserRecord, AppError> {
            let mut users = self.users.lock().unwrap();

            if let Some(new_name) = &patch.username {
                if users
                    .values()
                    .any(|u| u.id != id && &u.username == new_name)
                {
                    return Err(AppError::Conflict("Username already exists".to_string()));
                }
            }

            let record = users.get_mut(&id).ok_or(AppError::NotFound)?;
            if let Some(username) = patch.username {
                record.username = username;
            }
            if let Some(avatar_url) = patch.avatar_url {
                record.avatar_url = avatar_url;
            }
            if let Some(is_default) = patch.is_default_avatar {
                record.is_default_avatar = is_default;
            }
            if let Some(password_hash) = patch.password_hash {
                record.password_hash = password_hash;
            }
            record.updated_at = Utc::now();
            Ok(record.clone())
        }
    }
}
