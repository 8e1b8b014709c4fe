//! PostgreSQL implementation of the invitation store.
//!
//! The per-code critical section is a transaction holding a transaction-level
//! advisory lock on the hashed code. Waiters poll with
//! `pg_try_advisory_xact_lock` and hand their connection back between
//! attempts, so queued redemptions of one code never pin pool connections
//! the lock holder needs. Each server's bookkeeping runs in its own
//! transaction that starts by locking the invitation row.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::{Duration, Instant};
use uuid::Uuid;

use domain::models::{
    normalize_code, Account, DelegatedSession, Identity, Invitation, Library, MediaServer,
    NewAccount, NewIdentity, ServerUsage,
};
use domain::services::{CodeLease, InvitationStore, RedemptionTx, StoreError, UsageState};

use crate::entities::{
    AccountEntity, DelegatedSessionEntity, IdentityEntity, InvitationEntity, ServerUsageEntity,
};
use crate::metrics::QueryTimer;
use crate::repositories::{DelegatedSessionRepository, InvitationRepository, MediaServerRepository};

/// Default bound on waiting for another redemption of the same code.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(60);

const LOCK_RETRY_INITIAL: Duration = Duration::from_millis(10);
const LOCK_RETRY_MAX: Duration = Duration::from_millis(250);

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgInvitationStore {
    pool: PgPool,
    invitations: InvitationRepository,
    servers: MediaServerRepository,
    sessions: DelegatedSessionRepository,
    lock_wait: Duration,
}

impl PgInvitationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            invitations: InvitationRepository::new(pool.clone()),
            servers: MediaServerRepository::new(pool.clone()),
            sessions: DelegatedSessionRepository::new(pool.clone()),
            pool,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// How long `lock_code` waits for a concurrent redemption of the same
    /// code before giving up with [`StoreError::Unavailable`].
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Try once to take the advisory lock for `code`. The returned
    /// transaction holds the lock until it ends.
    async fn try_lock_code(
        &self,
        code: &str,
    ) -> Result<Option<Transaction<'static, Postgres>>, StoreError> {
        let timer = QueryTimer::new("try_lock_invitation_code");
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(code)
            .fetch_one(&mut *tx)
            .await;
        timer.record_result(&result);
        if result? {
            Ok(Some(tx))
        } else {
            tx.rollback().await?;
            Ok(None)
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete delegated sessions that expired before `now`.
    pub async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.sessions.delete_expired(now).await?)
    }
}

#[async_trait::async_trait]
impl InvitationStore for PgInvitationStore {
    async fn find_invitation(&self, code: &str) -> Result<Option<Invitation>, StoreError> {
        Ok(self.invitations.find_by_code(code).await?.map(Into::into))
    }

    async fn associated_servers(&self, invitation_id: Uuid) -> Result<Vec<MediaServer>, StoreError> {
        let servers = self.invitations.associated_servers(invitation_id).await?;
        Ok(servers.into_iter().map(Into::into).collect())
    }

    async fn find_server(&self, server_id: Uuid) -> Result<Option<MediaServer>, StoreError> {
        Ok(self.servers.find_by_id(server_id).await?.map(Into::into))
    }

    async fn first_server(&self) -> Result<Option<MediaServer>, StoreError> {
        Ok(self.servers.find_first().await?.map(Into::into))
    }

    async fn invitation_libraries(&self, invitation_id: Uuid) -> Result<Vec<Library>, StoreError> {
        let libraries = self.invitations.libraries(invitation_id).await?;
        Ok(libraries.into_iter().map(Into::into).collect())
    }

    async fn server_usages(&self, invitation_id: Uuid) -> Result<Vec<ServerUsage>, StoreError> {
        let usages = self.invitations.server_usages(invitation_id).await?;
        Ok(usages.into_iter().map(Into::into).collect())
    }

    async fn lock_code(&self, code: &str) -> Result<Box<dyn CodeLease>, StoreError> {
        let code = normalize_code(code);
        let deadline = Instant::now() + self.lock_wait;
        let mut backoff = LOCK_RETRY_INITIAL;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(tx) = self.try_lock_code(&code).await? {
                if attempts > 1 {
                    tracing::debug!(code = %code, attempts = attempts, "Acquired contended code lock");
                }
                return Ok(Box::new(PgCodeLease { tx }));
            }
            if Instant::now() + backoff > deadline {
                metrics::counter!("invitation_code_lock_timeouts_total").increment(1);
                tracing::warn!(code = %code, attempts = attempts, "Timed out waiting for code lock");
                return Err(StoreError::Unavailable(format!(
                    "another redemption of code {} is still running",
                    code
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(LOCK_RETRY_MAX);
        }
    }

    async fn begin(&self) -> Result<Box<dyn RedemptionTx>, StoreError> {
        Ok(Box::new(PgRedemptionTx {
            tx: self.pool.begin().await?,
        }))
    }

    async fn save_session(&self, session: &DelegatedSession) -> Result<(), StoreError> {
        let purged = self.sessions.delete_expired(Utc::now()).await?;
        if purged > 0 {
            tracing::debug!(purged = purged, "Removed expired delegated sessions");
        }
        let entity = DelegatedSessionEntity::try_from(session)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.sessions.insert(&entity).await?;
        Ok(())
    }

    async fn take_session(&self, key_hash: &str) -> Result<Option<DelegatedSession>, StoreError> {
        match self.sessions.take(key_hash).await? {
            Some(entity) => DelegatedSession::try_from(entity)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Advisory lock held for the duration of a redemption.
struct PgCodeLease {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl CodeLease for PgCodeLease {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        let lease = *self;
        lease.tx.commit().await?;
        Ok(())
    }
}

/// Bookkeeping transaction for one provisioned server.
struct PgRedemptionTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl RedemptionTx for PgRedemptionTx {
    async fn lock_invitation(&mut self, invitation_id: Uuid) -> Result<Option<Invitation>, StoreError> {
        let timer = QueryTimer::new("lock_invitation");
        let result = sqlx::query_as::<_, InvitationEntity>(
            r#"
            SELECT id, code, unlimited, used, used_at, used_by, expires, duration_days, server_id, created_at
            FROM invitations
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(invitation_id)
        .fetch_optional(&mut *self.tx)
        .await;
        timer.record();
        Ok(result?.map(Into::into))
    }

    async fn accounts_for_code(&mut self, code: &str) -> Result<Vec<Account>, StoreError> {
        let timer = QueryTimer::new("list_accounts_for_code");
        let result = sqlx::query_as::<_, AccountEntity>(
            r#"
            SELECT id, username, email, remote_id, server_id, code, identity_id, expires, created_at
            FROM accounts
            WHERE UPPER(code) = UPPER($1)
            ORDER BY created_at, id
            "#,
        )
        .bind(code)
        .fetch_all(&mut *self.tx)
        .await;
        timer.record();
        Ok(result?.into_iter().map(Into::into).collect())
    }

    async fn find_identity(&mut self, identity_id: Uuid) -> Result<Option<Identity>, StoreError> {
        let timer = QueryTimer::new("find_identity_by_id");
        let result = sqlx::query_as::<_, IdentityEntity>(
            r#"
            SELECT id, primary_email, primary_username, created_at
            FROM identities
            WHERE id = $1
            "#,
        )
        .bind(identity_id)
        .fetch_optional(&mut *self.tx)
        .await;
        timer.record();
        Ok(result?.map(Into::into))
    }

    async fn insert_identity(&mut self, identity: NewIdentity) -> Result<Identity, StoreError> {
        let timer = QueryTimer::new("insert_identity");
        let result = sqlx::query_as::<_, IdentityEntity>(
            r#"
            INSERT INTO identities (primary_email, primary_username)
            VALUES ($1, $2)
            RETURNING id, primary_email, primary_username, created_at
            "#,
        )
        .bind(identity.primary_email)
        .bind(identity.primary_username)
        .fetch_one(&mut *self.tx)
        .await;
        timer.record();
        Ok(result?.into())
    }

    async fn set_account_identity(
        &mut self,
        account_id: Uuid,
        identity_id: Uuid,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::new("set_account_identity");
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET identity_id = $2
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(identity_id)
        .execute(&mut *self.tx)
        .await;
        timer.record();
        result?;
        Ok(())
    }

    async fn insert_account(
        &mut self,
        account: &NewAccount,
        identity_id: Option<Uuid>,
    ) -> Result<Account, StoreError> {
        let timer = QueryTimer::new("insert_account");
        let result = sqlx::query_as::<_, AccountEntity>(
            r#"
            INSERT INTO accounts (username, email, remote_id, server_id, code, identity_id, expires)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, username, email, remote_id, server_id, code, identity_id, expires, created_at
            "#,
        )
        .bind(&account.username)
        .bind(&account.email)
        .bind(&account.remote_id)
        .bind(account.server_id)
        .bind(&account.code)
        .bind(identity_id)
        .bind(account.expires)
        .fetch_one(&mut *self.tx)
        .await;
        timer.record();
        Ok(result?.into())
    }

    async fn upsert_server_usage(
        &mut self,
        invitation_id: Uuid,
        server_id: Uuid,
        account_id: Uuid,
        used_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let timer = QueryTimer::new("upsert_server_usage");
        let result = sqlx::query(
            r#"
            INSERT INTO server_usages (invitation_id, server_id, account_id, used_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (invitation_id, server_id) DO NOTHING
            "#,
        )
        .bind(invitation_id)
        .bind(server_id)
        .bind(account_id)
        .bind(used_at)
        .execute(&mut *self.tx)
        .await;
        timer.record_result(&result);
        Ok(result?.rows_affected() == 1)
    }

    async fn server_usages(&mut self, invitation_id: Uuid) -> Result<Vec<ServerUsage>, StoreError> {
        let timer = QueryTimer::new("list_server_usages_locked");
        let result = sqlx::query_as::<_, ServerUsageEntity>(
            r#"
            SELECT invitation_id, server_id, account_id, used_at
            FROM server_usages
            WHERE invitation_id = $1
            ORDER BY used_at
            "#,
        )
        .bind(invitation_id)
        .fetch_all(&mut *self.tx)
        .await;
        timer.record();
        Ok(result?.into_iter().map(Into::into).collect())
    }

    async fn update_invitation_usage(
        &mut self,
        invitation_id: Uuid,
        state: UsageState,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::new("update_invitation_usage");
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET used = $2, used_at = $3, used_by = $4
            WHERE id = $1
            "#,
        )
        .bind(invitation_id)
        .bind(state.used)
        .bind(state.used_at)
        .bind(state.used_by)
        .execute(&mut *self.tx)
        .await;
        timer.record_result(&result);
        result?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}
