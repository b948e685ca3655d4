use async_trait::async_trait;
use common_auth::Principal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use thiserror::Error;

const UNIQUE_VIOLATION: &str = "23505";

const SELECT_USER: &str = r#"
    SELECT u.user_id, u.username, u.salt, u.pwhash, u.mailhash, u.active,
           COALESCE(
               array_agg(g.group_name ORDER BY g.group_name) FILTER (WHERE g.group_name IS NOT NULL),
               ARRAY[]::TEXT[]
           ) AS groups
    FROM users u
    LEFT JOIN user_groups ug ON ug.user_id = u.user_id
    LEFT JOIN groups g ON g.group_id = ug.group_id
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username '{0}' already exists")]
    Duplicate(String),
    #[error("user {0} not found")]
    NotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persisted account. Salt and hashes are standard base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub salt: String,
    pub password_hash: String,
    pub mail_hash: String,
    pub active: bool,
    pub groups: Vec<String>,
}

impl UserRecord {
    pub fn principal(&self) -> Principal {
        Principal::new(self.id, self.username.clone(), self.groups.iter().cloned())
    }
}

#[derive(Debug, Clone)]
pub struct NewUserRecord {
    pub username: String,
    pub salt: String,
    pub password_hash: String,
    pub mail_hash: String,
    pub active: bool,
    pub groups: Vec<String>,
}

/// Account persistence consumed by the credential flows.
///
/// Each call is atomic with respect to the single record it touches.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError>;
    async fn username_exists(&self, username: &str) -> Result<bool, StoreError>;
    /// Insert a new account, returning its identifier. The salt is written once, here.
    async fn insert(&self, user: NewUserRecord) -> Result<i64, StoreError>;
    async fn update_password_hash(&self, id: i64, password_hash: &str) -> Result<(), StoreError>;
    /// Fails with [`StoreError::Duplicate`] when another account holds `username`.
    async fn update_username(&self, id: i64, username: &str) -> Result<(), StoreError>;
    async fn update_groups(&self, id: i64, groups: &[String]) -> Result<(), StoreError>;
    async fn update_active_flag(&self, id: i64, active: bool) -> Result<(), StoreError>;
    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError>;
}

#[derive(FromRow)]
struct UserRow {
    user_id: i64,
    username: String,
    salt: String,
    pwhash: String,
    mailhash: String,
    active: bool,
    groups: Vec<String>,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.user_id,
            username: row.username,
            salt: row.salt,
            password_hash: row.pwhash,
            mail_hash: row.mailhash,
            active: row.active,
            groups: row.groups,
        }
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn replace_groups(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        groups: &[String],
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM user_groups WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for group in groups {
            sqlx::query(
                "INSERT INTO groups (group_name) VALUES ($1) ON CONFLICT (group_name) DO NOTHING",
            )
            .bind(group)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO user_groups (user_id, group_id)
                 SELECT $1, group_id FROM groups WHERE group_name = $2
                 ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(group)
            .execute(&mut *tx)
            .await?;
        }
        Ok(())
    }
}

fn map_unique_error(err: sqlx::Error, username: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            StoreError::Duplicate(username.to_string())
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let query = format!("{SELECT_USER} WHERE u.username = $1 GROUP BY u.user_id");
        let row = sqlx::query_as::<_, UserRow>(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(UserRecord::from))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        let query = format!("{SELECT_USER} WHERE u.user_id = $1 GROUP BY u.user_id");
        let row = sqlx::query_as::<_, UserRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(UserRecord::from))
    }

    async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE username = $1)")
                .bind(username)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert(&self, user: NewUserRecord) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (username, salt, pwhash, active, mailhash)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING user_id",
        )
        .bind(&user.username)
        .bind(&user.salt)
        .bind(&user.password_hash)
        .bind(user.active)
        .bind(&user.mail_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| map_unique_error(err, &user.username))?;

        Self::replace_groups(&mut tx, id, &user.groups).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn update_password_hash(&self, id: i64, password_hash: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET pwhash = $1 WHERE user_id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update_username(&self, id: i64, username: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET username = $1 WHERE user_id = $2")
            .bind(username)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| map_unique_error(err, username))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update_groups(&self, id: i64, groups: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(id));
        }
        Self::replace_groups(&mut tx, id, groups).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_active_flag(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET active = $1 WHERE user_id = $2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let query = format!("{SELECT_USER} GROUP BY u.user_id ORDER BY u.user_id");
        let rows = sqlx::query_as::<_, UserRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(UserRecord::from).collect())
    }
}
