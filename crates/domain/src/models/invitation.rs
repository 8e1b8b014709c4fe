//! Invitation domain models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default length for generated invitation codes.
pub const DEFAULT_CODE_LENGTH: usize = 6;

/// Shortest accepted invitation code.
pub const MIN_CODE_LENGTH: usize = 6;

/// Longest accepted invitation code.
pub const MAX_CODE_LENGTH: usize = 10;

/// A redeemable code granting provisioning rights on one or more servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Invitation {
    pub id: Uuid,
    pub code: String,
    /// Unlimited codes stay redeemable until they expire.
    pub unlimited: bool,
    /// For unlimited codes this is a display flag only.
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    /// First account provisioned with this code.
    pub used_by: Option<Uuid>,
    pub expires: Option<DateTime<Utc>>,
    /// Days of access granted to provisioned accounts.
    pub duration_days: Option<i32>,
    /// Single-server reference kept for invitations created before the
    /// many-to-many association existed.
    pub legacy_server_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    /// Create an unused, non-expiring, limited invitation with the given code.
    pub fn new(code: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: normalize_code(code),
            unlimited: false,
            used: false,
            used_at: None,
            used_by: None,
            expires: None,
            duration_days: None,
            legacy_server_id: None,
            created_at: Utc::now(),
        }
    }

    /// Check if the invitation has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Check if the given code refers to this invitation.
    pub fn matches_code(&self, code: &str) -> bool {
        self.code.eq_ignore_ascii_case(code.trim())
    }

    /// Expiry for an account provisioned at `now`, if the invitation grants
    /// a limited duration.
    pub fn account_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration_days
            .filter(|days| *days > 0)
            .map(|days| now + Duration::days(days as i64))
    }
}

/// Accepted code length range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBounds {
    pub min: usize,
    pub max: usize,
}

impl CodeBounds {
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, length: usize) -> bool {
        (self.min..=self.max).contains(&length)
    }
}

impl Default for CodeBounds {
    fn default() -> Self {
        Self {
            min: MIN_CODE_LENGTH,
            max: MAX_CODE_LENGTH,
        }
    }
}

/// Canonical form of a code: trimmed and uppercased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Generate a random invitation code of the default length.
pub fn generate_invitation_code() -> String {
    shared::crypto::generate_invitation_code(DEFAULT_CODE_LENGTH)
}
