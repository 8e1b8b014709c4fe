//! Invitation entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Database row mapping for the invitations table.
#[derive(Debug, Clone, FromRow)]
pub struct InvitationEntity {
    pub id: Uuid,
    pub code: String,
    pub unlimited: bool,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<Uuid>,
    pub expires: Option<DateTime<Utc>>,
    pub duration_days: Option<i32>,
    pub server_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<InvitationEntity> for domain::models::Invitation {
    fn from(entity: InvitationEntity) -> Self {
        Self {
            id: entity.id,
            code: entity.code,
            unlimited: entity.unlimited,
            used: entity.used,
            used_at: entity.used_at,
            used_by: entity.used_by,
            expires: entity.expires,
            duration_days: entity.duration_days,
            legacy_server_id: entity.server_id,
            created_at: entity.created_at,
        }
    }
}
