//! Storage contract used by the redemption engine.
//!
//! [`InvitationStore`] covers pool-level reads and the per-code critical
//! section. Writes made on behalf of one provisioned server go through a
//! [`RedemptionTx`] so they commit or roll back together.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Account, DelegatedSession, Identity, Invitation, Library, MediaServer, NewAccount,
    NewIdentity, ServerUsage,
};

/// Errors raised by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored data is invalid: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Aggregate usage columns of an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageState {
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<Uuid>,
}

/// Pool-level access to invitations, servers and delegated sessions.
#[async_trait::async_trait]
pub trait InvitationStore: Send + Sync {
    /// Find an invitation by code, ignoring case.
    async fn find_invitation(&self, code: &str) -> Result<Option<Invitation>, StoreError>;

    /// Servers associated with the invitation, in association order.
    async fn associated_servers(&self, invitation_id: Uuid) -> Result<Vec<MediaServer>, StoreError>;

    async fn find_server(&self, server_id: Uuid) -> Result<Option<MediaServer>, StoreError>;

    /// The oldest configured server, used when an invitation names none.
    async fn first_server(&self) -> Result<Option<MediaServer>, StoreError>;

    /// Library restrictions of the invitation across all servers.
    async fn invitation_libraries(&self, invitation_id: Uuid) -> Result<Vec<Library>, StoreError>;

    async fn server_usages(&self, invitation_id: Uuid) -> Result<Vec<ServerUsage>, StoreError>;

    /// Enter the critical section for a code. Waits while another
    /// redemption of the same code holds it; implementations may give up
    /// with [`StoreError::Unavailable`] after a bounded wait.
    async fn lock_code(&self, code: &str) -> Result<Box<dyn CodeLease>, StoreError>;

    /// Start a transaction for one server's bookkeeping.
    async fn begin(&self) -> Result<Box<dyn RedemptionTx>, StoreError>;

    async fn save_session(&self, session: &DelegatedSession) -> Result<(), StoreError>;

    /// Remove and return the session stored under `key_hash`.
    async fn take_session(&self, key_hash: &str) -> Result<Option<DelegatedSession>, StoreError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Held while a code is being redeemed.
#[async_trait::async_trait]
pub trait CodeLease: Send {
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

/// Transactional writes for a single provisioned server.
///
/// Dropping the transaction without calling [`RedemptionTx::commit`] discards
/// every write made through it.
#[async_trait::async_trait]
pub trait RedemptionTx: Send {
    /// Load the invitation and lock its row until commit.
    async fn lock_invitation(&mut self, invitation_id: Uuid) -> Result<Option<Invitation>, StoreError>;

    /// Accounts created with the code, oldest first.
    async fn accounts_for_code(&mut self, code: &str) -> Result<Vec<Account>, StoreError>;

    async fn find_identity(&mut self, identity_id: Uuid) -> Result<Option<Identity>, StoreError>;

    async fn insert_identity(&mut self, identity: NewIdentity) -> Result<Identity, StoreError>;

    async fn set_account_identity(
        &mut self,
        account_id: Uuid,
        identity_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn insert_account(
        &mut self,
        account: &NewAccount,
        identity_id: Option<Uuid>,
    ) -> Result<Account, StoreError>;

    /// Write a usage row. Returns false if one already existed for the
    /// invitation and server.
    async fn upsert_server_usage(
        &mut self,
        invitation_id: Uuid,
        server_id: Uuid,
        account_id: Uuid,
        used_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn server_usages(&mut self, invitation_id: Uuid) -> Result<Vec<ServerUsage>, StoreError>;

    async fn update_invitation_usage(
        &mut self,
        invitation_id: Uuid,
        state: UsageState,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
