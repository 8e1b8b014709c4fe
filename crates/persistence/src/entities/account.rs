//! Account, identity and server usage entities (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Database row mapping for the accounts table.
#[derive(Debug, Clone, FromRow)]
pub struct AccountEntity {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub remote_id: Option<String>,
    pub server_id: Uuid,
    pub code: String,
    pub identity_id: Option<Uuid>,
    pub expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<AccountEntity> for domain::models::Account {
    fn from(entity: AccountEntity) -> Self {
        Self {
            id: entity.id,
            username: entity.username,
            email: entity.email,
            remote_id: entity.remote_id,
            server_id: entity.server_id,
            code: entity.code,
            identity_id: entity.identity_id,
            expires: entity.expires,
            created_at: entity.created_at,
        }
    }
}

/// Database row mapping for the identities table.
#[derive(Debug, Clone, FromRow)]
pub struct IdentityEntity {
    pub id: Uuid,
    pub primary_email: Option<String>,
    pub primary_username: String,
    pub created_at: DateTime<Utc>,
}

impl From<IdentityEntity> for domain::models::Identity {
    fn from(entity: IdentityEntity) -> Self {
        Self {
            id: entity.id,
            primary_email: entity.primary_email,
            primary_username: entity.primary_username,
            created_at: entity.created_at,
        }
    }
}

/// Database row mapping for the server_usages table.
#[derive(Debug, Clone, FromRow)]
pub struct ServerUsageEntity {
    pub invitation_id: Uuid,
    pub server_id: Uuid,
    pub account_id: Option<Uuid>,
    pub used_at: DateTime<Utc>,
}

impl From<ServerUsageEntity> for domain::models::ServerUsage {
    fn from(entity: ServerUsageEntity) -> Self {
        Self {
            invitation_id: entity.invitation_id,
            server_id: entity.server_id,
            account_id: entity.account_id,
            used_at: entity.used_at,
        }
    }
}
