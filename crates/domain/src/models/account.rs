//! Locally mirrored accounts, identities and per-server usage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local record of an account created on a remote backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    /// Identifier or token returned by the backend.
    pub remote_id: Option<String>,
    pub server_id: Uuid,
    pub code: String,
    pub identity_id: Option<Uuid>,
    pub expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Account attributes gathered before the local record is written.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: Option<String>,
    pub remote_id: Option<String>,
    pub server_id: Uuid,
    pub code: String,
    pub expires: Option<DateTime<Utc>>,
}

impl NewAccount {
    /// The email if it is present and not blank.
    pub fn usable_email(&self) -> Option<&str> {
        non_blank(self.email.as_deref())
    }
}

/// One real person across several backend accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Identity {
    pub id: Uuid,
    pub primary_email: Option<String>,
    pub primary_username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIdentity {
    pub primary_email: Option<String>,
    pub primary_username: String,
}

/// Record that an invitation has been redeemed on a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerUsage {
    pub invitation_id: Uuid,
    pub server_id: Uuid,
    /// Cleared when the account is later removed; the usage itself stays.
    pub account_id: Option<Uuid>,
    pub used_at: DateTime<Utc>,
}

/// Returns the trimmed value unless it is missing or blank.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
