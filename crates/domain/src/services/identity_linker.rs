//! Cross-server identity linking.
//!
//! An account joins an identity only when something corroborates that it
//! belongs to the same person as another account:
//!
//! 1. A limited invitation redeemed on several servers. All accounts created
//!    with the code share the identity of the first one.
//! 2. An unlimited invitation where the account's email equals the verified
//!    email returned by the delegated-token step of the same attempt. Only
//!    accounts from that attempt are linked.
//!
//! Sharing an unlimited code is never enough on its own.

use uuid::Uuid;

use super::store::{RedemptionTx, StoreError};
use crate::models::{
    non_blank, Account, Identity, Invitation, NewAccount, NewIdentity, RedemptionAttempt,
};

/// What to do with a new account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDecision {
    /// Leave the account without an identity.
    None,
    /// Join an existing identity and attach `also_link` to it as well.
    Join {
        identity_id: Uuid,
        also_link: Vec<Uuid>,
    },
    /// Create an identity for the new account and `also_link`.
    Create {
        identity: NewIdentity,
        also_link: Vec<Uuid>,
    },
}

/// An identity together with the previously unlinked accounts attached to it.
#[derive(Debug, Clone)]
pub struct Linked {
    pub identity: Identity,
    pub linked_accounts: Vec<Uuid>,
}

/// Decide how to link `new` given the accounts already created with the
/// code and the state of the current attempt.
pub fn decide(
    invitation: Option<&Invitation>,
    existing: &[Account],
    new: &NewAccount,
    attempt: &RedemptionAttempt,
) -> LinkDecision {
    let Some(invitation) = invitation else {
        return LinkDecision::None;
    };

    if !invitation.unlimited {
        let Some(first) = existing.first() else {
            return LinkDecision::None;
        };
        let unlinked: Vec<Uuid> = existing
            .iter()
            .filter(|a| a.identity_id.is_none())
            .map(|a| a.id)
            .collect();
        return match first.identity_id {
            Some(identity_id) => LinkDecision::Join {
                identity_id,
                also_link: unlinked,
            },
            None => LinkDecision::Create {
                identity: NewIdentity {
                    primary_email: non_blank(first.email.as_deref())
                        .or_else(|| new.usable_email())
                        .map(str::to_string),
                    primary_username: first.username.clone(),
                },
                also_link: unlinked,
            },
        };
    }

    let (Some(verified), Some(email)) = (
        non_blank(attempt.verified_email.as_deref()),
        new.usable_email(),
    ) else {
        return LinkDecision::None;
    };
    if !verified.eq_ignore_ascii_case(email) {
        return LinkDecision::None;
    }

    let partners: Vec<_> = attempt
        .accounts
        .iter()
        .filter(|a| non_blank(a.email.as_deref()).is_some_and(|e| e.eq_ignore_ascii_case(verified)))
        .collect();
    let Some(first) = partners.first() else {
        return LinkDecision::None;
    };
    let unlinked: Vec<Uuid> = partners
        .iter()
        .filter(|a| a.identity_id.is_none())
        .map(|a| a.account_id)
        .collect();

    match partners.iter().find_map(|a| a.identity_id) {
        Some(identity_id) => LinkDecision::Join {
            identity_id,
            also_link: unlinked,
        },
        None => LinkDecision::Create {
            identity: NewIdentity {
                primary_email: Some(verified.to_string()),
                primary_username: first.username.clone(),
            },
            also_link: unlinked,
        },
    }
}

/// Apply a link decision inside the server's transaction.
///
/// Returns the identity the new account should reference, if any.
pub async fn link_or_create(
    tx: &mut dyn RedemptionTx,
    decision: LinkDecision,
) -> Result<Option<Linked>, StoreError> {
    let (identity, also_link) = match decision {
        LinkDecision::None => return Ok(None),
        LinkDecision::Join {
            identity_id,
            also_link,
        } => match tx.find_identity(identity_id).await? {
            Some(identity) => (identity, also_link),
            None => {
                return Err(StoreError::Corrupt(format!(
                    "account references missing identity {}",
                    identity_id
                )))
            }
        },
        LinkDecision::Create {
            identity,
            also_link,
        } => (tx.insert_identity(identity).await?, also_link),
    };

    for account_id in &also_link {
        tx.set_account_identity(*account_id, identity.id).await?;
    }

    Ok(Some(Linked {
        identity,
        linked_accounts: also_link,
    }))
}
