//! Delegated session entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::DelegatedSession;
use sqlx::FromRow;
use uuid::Uuid;

/// Database row mapping for the delegated_sessions table.
///
/// The attempt and the phase-one results are stored as JSONB.
#[derive(Debug, Clone, FromRow)]
pub struct DelegatedSessionEntity {
    pub key_hash: String,
    pub invitation_id: Uuid,
    pub code: String,
    pub attempt: serde_json::Value,
    pub results: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TryFrom<DelegatedSessionEntity> for DelegatedSession {
    type Error = serde_json::Error;

    fn try_from(entity: DelegatedSessionEntity) -> Result<Self, Self::Error> {
        Ok(Self {
            key_hash: entity.key_hash,
            invitation_id: entity.invitation_id,
            code: entity.code,
            attempt: serde_json::from_value(entity.attempt)?,
            results: serde_json::from_value(entity.results)?,
            created_at: entity.created_at,
            expires_at: entity.expires_at,
        })
    }
}

impl TryFrom<&DelegatedSession> for DelegatedSessionEntity {
    type Error = serde_json::Error;

    fn try_from(session: &DelegatedSession) -> Result<Self, Self::Error> {
        Ok(Self {
            key_hash: session.key_hash.clone(),
            invitation_id: session.invitation_id,
            code: session.code.clone(),
            attempt: serde_json::to_value(&session.attempt)?,
            results: serde_json::to_value(&session.results)?,
            created_at: session.created_at,
            expires_at: session.expires_at,
        })
    }
}
