//! Invitation repository for database operations.

use sqlx::PgPool;
use uuid::Uuid;

use crate::entities::{InvitationEntity, LibraryEntity, MediaServerEntity, ServerUsageEntity};
use crate::metrics::QueryTimer;

/// Repository for invitation lookups done outside a redemption transaction.
#[derive(Clone)]
pub struct InvitationRepository {
    pool: PgPool,
}

impl InvitationRepository {
    /// Creates a new InvitationRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find an invitation by code, ignoring case.
    pub async fn find_by_code(&self, code: &str) -> Result<Option<InvitationEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_invitation_by_code");
        let result = sqlx::query_as::<_, InvitationEntity>(
            r#"
            SELECT id, code, unlimited, used, used_at, used_by, expires, duration_days, server_id, created_at
            FROM invitations
            WHERE UPPER(code) = UPPER($1)
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await;
        timer.record();
        result
    }

    /// Servers associated with an invitation, in association order.
    pub async fn associated_servers(
        &self,
        invitation_id: Uuid,
    ) -> Result<Vec<MediaServerEntity>, sqlx::Error> {
        let timer = QueryTimer::new("list_invitation_servers");
        let result = sqlx::query_as::<_, MediaServerEntity>(
            r#"
            SELECT s.id, s.name, s.server_type, s.url, s.api_key, s.verified, s.created_at
            FROM invitation_servers isv
            JOIN media_servers s ON s.id = isv.server_id
            WHERE isv.invitation_id = $1
            ORDER BY isv.position, s.created_at, s.id
            "#,
        )
        .bind(invitation_id)
        .fetch_all(&self.pool)
        .await;
        timer.record();
        result
    }

    /// Library restrictions of an invitation.
    pub async fn libraries(&self, invitation_id: Uuid) -> Result<Vec<LibraryEntity>, sqlx::Error> {
        let timer = QueryTimer::new("list_invitation_libraries");
        let result = sqlx::query_as::<_, LibraryEntity>(
            r#"
            SELECT l.id, l.server_id, l.external_id, l.name
            FROM invitation_libraries il
            JOIN libraries l ON l.id = il.library_id
            WHERE il.invitation_id = $1
            ORDER BY l.name
            "#,
        )
        .bind(invitation_id)
        .fetch_all(&self.pool)
        .await;
        timer.record();
        result
    }

    /// Usage rows recorded for an invitation.
    pub async fn server_usages(
        &self,
        invitation_id: Uuid,
    ) -> Result<Vec<ServerUsageEntity>, sqlx::Error> {
        let timer = QueryTimer::new("list_server_usages");
        let result = sqlx::query_as::<_, ServerUsageEntity>(
            r#"
            SELECT invitation_id, server_id, account_id, used_at
            FROM server_usages
            WHERE invitation_id = $1
            ORDER BY used_at
            "#,
        )
        .bind(invitation_id)
        .fetch_all(&self.pool)
        .await;
        timer.record();
        result
    }
}
