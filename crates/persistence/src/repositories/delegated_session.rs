//! Delegated session repository for database operations.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::entities::DelegatedSessionEntity;
use crate::metrics::QueryTimer;

/// Repository for sessions carried between the two phases of a hybrid
/// redemption.
#[derive(Clone)]
pub struct DelegatedSessionRepository {
    pool: PgPool,
}

impl DelegatedSessionRepository {
    /// Creates a new DelegatedSessionRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a session.
    pub async fn insert(&self, session: &DelegatedSessionEntity) -> Result<(), sqlx::Error> {
        let timer = QueryTimer::new("insert_delegated_session");
        let result = sqlx::query(
            r#"
            INSERT INTO delegated_sessions
                (key_hash, invitation_id, code, attempt, results, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&session.key_hash)
        .bind(session.invitation_id)
        .bind(&session.code)
        .bind(&session.attempt)
        .bind(&session.results)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await;
        timer.record();
        result.map(|_| ())
    }

    /// Delete and return the session stored under `key_hash`.
    pub async fn take(&self, key_hash: &str) -> Result<Option<DelegatedSessionEntity>, sqlx::Error> {
        let timer = QueryTimer::new("take_delegated_session");
        let result = sqlx::query_as::<_, DelegatedSessionEntity>(
            r#"
            DELETE FROM delegated_sessions
            WHERE key_hash = $1
            RETURNING key_hash, invitation_id, code, attempt, results, created_at, expires_at
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await;
        timer.record();
        result
    }

    /// Remove sessions that expired before `now`.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let timer = QueryTimer::new("delete_expired_delegated_sessions");
        let result = sqlx::query(
            r#"
            DELETE FROM delegated_sessions
            WHERE expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        timer.record();
        Ok(result.rows_affected())
    }
}
