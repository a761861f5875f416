//! Postgres store. Schema lives in `sql/schema.sql`.
//!
//! Single-use semantics rely on conditional `UPDATE ... RETURNING` and
//! `DELETE ... RETURNING`, never on read-then-write from the application.

use super::{
    Approval, AssociationToken, ChallengeRecord, Consumption, FactorRecord, HostBinding, Pruned,
    Purpose, Session, Store, StoreError, Tier, User,
};
use crate::factor::Factor;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
    types::Json,
};
use std::time::Duration;
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db_err)
                if db_err
                    .code()
                    .is_some_and(|code| code.as_ref() == UNIQUE_VIOLATION) =>
            {
                Self::Conflict(db_err.message().to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

fn decode_error(column: &str, err: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: err.to_string().into(),
    }
}

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            is_admin: row.try_get("is_admin")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Session {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let tier: String = row.try_get("tier")?;
        Ok(Self {
            id: row.try_get("id")?,
            token_hash: row.try_get("token_hash")?,
            user_id: row.try_get("user_id")?,
            tier: tier.parse().map_err(|err| decode_error("tier", err))?,
            csrf_token: row.try_get("csrf_token")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for FactorRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let Json(factor): Json<Factor> = row.try_get("factor")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            factor,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for ChallengeRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let Json(purpose): Json<Purpose> = row.try_get("purpose")?;
        let approval: Option<String> = row.try_get("approval")?;
        let host: Option<Json<HostBinding>> = row.try_get("host")?;
        Ok(Self {
            id: row.try_get("id")?,
            nonce: row.try_get("nonce")?,
            user_id: row.try_get("user_id")?,
            session_id: row.try_get("session_id")?,
            purpose,
            approval: approval
                .map(|value| value.parse::<Approval>())
                .transpose()
                .map_err(|err| decode_error("approval", err))?,
            host: host.map(|Json(host)| host),
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            consumed_at: row.try_get("consumed_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for AssociationToken {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            token_hash: row.try_get("token_hash")?,
            user_id: row.try_get("user_id")?,
            session_id: row.try_get("session_id")?,
            username: row.try_get("username")?,
            public_key: row.try_get("public_key")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

const CHALLENGE_COLUMNS: &str = "id, nonce, user_id, session_id, purpose, approval, host, \
                                 created_at, expires_at, consumed_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a small pool to `dsn`.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .acquire_timeout(Duration::from_secs(5))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self { pool })
    }

    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO users (id, username, password_hash, is_admin, created_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        sqlx::query(query)
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(user.is_admin)
            .bind(user.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let query = r"
            SELECT id, username, password_hash, is_admin, created_at
            FROM users
            WHERE id = $1
        ";
        Ok(sqlx::query_as::<_, User>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_name(&self, username: &str) -> Result<Option<User>, StoreError> {
        let query = r"
            SELECT id, username, password_hash, is_admin, created_at
            FROM users
            WHERE username = $1
        ";
        Ok(sqlx::query_as::<_, User>(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO sessions (id, token_hash, user_id, tier, csrf_token, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(&session.token_hash)
            .bind(session.user_id)
            .bind(session.tier.as_str())
            .bind(&session.csrf_token)
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_session(&self, token_hash: &[u8]) -> Result<Option<Session>, StoreError> {
        let query = r"
            SELECT id, token_hash, user_id, tier, csrf_token, created_at, expires_at
            FROM sessions
            WHERE token_hash = $1
        ";
        Ok(sqlx::query_as::<_, Session>(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_session_tier(
        &self,
        id: Uuid,
        from: Tier,
        to: Tier,
    ) -> Result<bool, StoreError> {
        let query = r"
            UPDATE sessions
            SET tier = $3
            WHERE id = $1
              AND tier = $2
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_factor(&self, record: &FactorRecord) -> Result<(), StoreError> {
        let linked_username = match &record.factor {
            Factor::LinkedAccount { username, .. } => Some(username.as_str()),
            _ => None,
        };
        let query = r"
            INSERT INTO factors (id, user_id, name, kind, linked_username, factor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        sqlx::query(query)
            .bind(record.id)
            .bind(record.user_id)
            .bind(&record.name)
            .bind(record.kind().as_str())
            .bind(linked_username)
            .bind(Json(&record.factor))
            .bind(record.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_factor(&self, id: Uuid) -> Result<Option<FactorRecord>, StoreError> {
        let query = r"
            SELECT id, user_id, name, factor, created_at, last_used_at
            FROM factors
            WHERE id = $1
        ";
        Ok(sqlx::query_as::<_, FactorRecord>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_factors(&self, user_id: Uuid) -> Result<Vec<FactorRecord>, StoreError> {
        let query = r"
            SELECT id, user_id, name, factor, created_at, last_used_at
            FROM factors
            WHERE user_id = $1
            ORDER BY created_at
        ";
        Ok(sqlx::query_as::<_, FactorRecord>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn find_linked_factor(
        &self,
        username: &str,
    ) -> Result<Option<FactorRecord>, StoreError> {
        let query = r"
            SELECT id, user_id, name, factor, created_at, last_used_at
            FROM factors
            WHERE linked_username = $1
        ";
        Ok(sqlx::query_as::<_, FactorRecord>(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn touch_factor(
        &self,
        id: Uuid,
        previous: &Factor,
        updated: &Factor,
        used_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = r"
            UPDATE factors
            SET factor = $3,
                last_used_at = $4
            WHERE id = $1
              AND factor = $2
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(Json(previous))
            .bind(Json(updated))
            .bind(used_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_factor(&self, id: Uuid, owner: Option<Uuid>) -> Result<bool, StoreError> {
        let query = r"
            DELETE FROM factors
            WHERE id = $1
              AND ($2::uuid IS NULL OR user_id = $2)
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_challenge(&self, challenge: &ChallengeRecord) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO challenges
                (id, nonce, user_id, session_id, purpose, approval, host, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        sqlx::query(query)
            .bind(challenge.id)
            .bind(&challenge.nonce)
            .bind(challenge.user_id)
            .bind(challenge.session_id)
            .bind(Json(&challenge.purpose))
            .bind(challenge.approval.map(Approval::as_str))
            .bind(challenge.host.as_ref().map(Json))
            .bind(challenge.created_at)
            .bind(challenge.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_challenge(&self, id: Uuid) -> Result<Option<ChallengeRecord>, StoreError> {
        let query = format!("SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE id = $1");
        Ok(sqlx::query_as::<_, ChallengeRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn consume_challenge(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Consumption, StoreError> {
        let query = format!(
            "UPDATE challenges SET consumed_at = $2 \
             WHERE id = $1 AND consumed_at IS NULL \
             RETURNING {CHALLENGE_COLUMNS}"
        );
        let taken = sqlx::query_as::<_, ChallengeRecord>(&query)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(record) = taken {
            return Ok(Consumption::Taken(record));
        }
        let exists = sqlx::query("SELECT 1 FROM challenges WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(if exists.is_some() {
            Consumption::AlreadyConsumed
        } else {
            Consumption::Missing
        })
    }

    async fn set_approval(
        &self,
        id: Uuid,
        user_id: Uuid,
        approval: Approval,
    ) -> Result<bool, StoreError> {
        let query = r"
            UPDATE challenges
            SET approval = $3,
                user_id = $2
            WHERE id = $1
              AND approval = 'pending'
              AND consumed_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(user_id)
            .bind(approval.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn bind_host(&self, id: Uuid, host: &HostBinding) -> Result<bool, StoreError> {
        let query = r"
            UPDATE challenges
            SET host = $2
            WHERE id = $1
              AND consumed_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(Json(host))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_association(&self, token: &AssociationToken) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO association_tokens
                (token_hash, user_id, session_id, username, public_key, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        sqlx::query(query)
            .bind(&token.token_hash)
            .bind(token.user_id)
            .bind(token.session_id)
            .bind(&token.username)
            .bind(&token.public_key)
            .bind(token.created_at)
            .bind(token.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_association(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<AssociationToken>, StoreError> {
        let query = r"
            SELECT token_hash, user_id, session_id, username, public_key, created_at, expires_at
            FROM association_tokens
            WHERE token_hash = $1
        ";
        Ok(sqlx::query_as::<_, AssociationToken>(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn take_association(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<AssociationToken>, StoreError> {
        let query = r"
            DELETE FROM association_tokens
            WHERE token_hash = $1
            RETURNING token_hash, user_id, session_id, username, public_key, created_at, expires_at
        ";
        Ok(sqlx::query_as::<_, AssociationToken>(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<Pruned, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let challenges = sqlx::query("DELETE FROM challenges WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let associations = sqlx::query("DELETE FROM association_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(Pruned {
            sessions,
            challenges,
            associations,
        })
    }
}
