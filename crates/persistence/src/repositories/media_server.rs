//! Media server repository for database operations.

use sqlx::PgPool;
use uuid::Uuid;

use crate::entities::MediaServerEntity;
use crate::metrics::QueryTimer;

/// Repository for media server lookups.
#[derive(Clone)]
pub struct MediaServerRepository {
    pool: PgPool,
}

impl MediaServerRepository {
    /// Creates a new MediaServerRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find a server by ID.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<MediaServerEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_media_server_by_id");
        let result = sqlx::query_as::<_, MediaServerEntity>(
            r#"
            SELECT id, name, server_type, url, api_key, verified, created_at
            FROM media_servers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await;
        timer.record();
        result
    }

    /// The oldest configured server.
    pub async fn find_first(&self) -> Result<Option<MediaServerEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_first_media_server");
        let result = sqlx::query_as::<_, MediaServerEntity>(
            r#"
            SELECT id, name, server_type, url, api_key, verified, created_at
            FROM media_servers
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await;
        timer.record();
        result
    }
}
