//! Per-server and aggregate invitation usage.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::{RedemptionTx, StoreError, UsageState};
use crate::models::{Invitation, ServerUsage};

/// Compute the aggregate usage columns after `account_id` was provisioned.
///
/// A limited invitation is used once every target server has a usage row.
/// An unlimited one is flagged on its first redemption. `used` never goes
/// back to false and `used_by` always names the first redeemer.
pub fn recompute(
    invitation: &Invitation,
    target_servers: &[Uuid],
    usages: &[ServerUsage],
    account_id: Uuid,
    now: DateTime<Utc>,
) -> UsageState {
    let complete = invitation.unlimited
        || target_servers
            .iter()
            .all(|server_id| usages.iter().any(|u| u.server_id == *server_id));
    let used = invitation.used || complete;

    UsageState {
        used,
        used_at: match invitation.used_at {
            Some(at) => Some(at),
            None if used => Some(now),
            None => None,
        },
        used_by: invitation.used_by.or(Some(account_id)),
    }
}

/// Record that `account_id` redeemed the invitation on `server_id` and update
/// the aggregate columns. Writing the same server twice keeps one row.
pub async fn mark_used(
    tx: &mut dyn RedemptionTx,
    invitation: &Invitation,
    target_servers: &[Uuid],
    server_id: Uuid,
    account_id: Uuid,
    now: DateTime<Utc>,
) -> Result<UsageState, StoreError> {
    let inserted = tx
        .upsert_server_usage(invitation.id, server_id, account_id, now)
        .await?;
    if !inserted {
        tracing::debug!(
            invitation_id = %invitation.id,
            server_id = %server_id,
            "Usage already recorded for server"
        );
    }

    let usages = tx.server_usages(invitation.id).await?;
    let state = recompute(invitation, target_servers, &usages, account_id, now);
    let current = UsageState {
        used: invitation.used,
        used_at: invitation.used_at,
        used_by: invitation.used_by,
    };
    if state != current {
        tx.update_invitation_usage(invitation.id, state).await?;
    }
    Ok(state)
}
