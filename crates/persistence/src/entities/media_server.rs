//! Media server and library entities (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Database row mapping for the media_servers table.
#[derive(Debug, Clone, FromRow)]
pub struct MediaServerEntity {
    pub id: Uuid,
    pub name: String,
    pub server_type: String,
    pub url: String,
    pub api_key: Option<String>,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl From<MediaServerEntity> for domain::models::MediaServer {
    fn from(entity: MediaServerEntity) -> Self {
        Self {
            id: entity.id,
            name: entity.name,
            server_type: entity.server_type,
            url: entity.url,
            api_key: entity.api_key,
            verified: entity.verified,
            created_at: entity.created_at,
        }
    }
}

/// Database row mapping for the libraries table.
#[derive(Debug, Clone, FromRow)]
pub struct LibraryEntity {
    pub id: Uuid,
    pub server_id: Uuid,
    pub external_id: String,
    pub name: String,
}

impl From<LibraryEntity> for domain::models::Library {
    fn from(entity: LibraryEntity) -> Self {
        Self {
            id: entity.id,
            server_id: entity.server_id,
            external_id: entity.external_id,
            name: entity.name,
        }
    }
}
