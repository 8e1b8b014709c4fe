//! In-memory store for development and testing.
//!
//! Transactions take the state lock for their whole lifetime and work on a
//! copy that is swapped in on commit, so an uncommitted transaction leaves no
//! trace.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::store::{CodeLease, InvitationStore, RedemptionTx, StoreError, UsageState};
use crate::models::{
    normalize_code, Account, DelegatedSession, Identity, Invitation, Library, MediaServer,
    NewAccount, NewIdentity, ServerUsage,
};

type CodeLocks = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Debug, Default, Clone)]
struct MemoryState {
    invitations: Vec<Invitation>,
    servers: Vec<MediaServer>,
    invitation_servers: HashMap<Uuid, Vec<Uuid>>,
    libraries: Vec<Library>,
    invitation_libraries: HashMap<Uuid, Vec<Uuid>>,
    accounts: Vec<Account>,
    identities: Vec<Identity>,
    usages: Vec<ServerUsage>,
    sessions: HashMap<String, DelegatedSession>,
}

/// Store backed by process memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    code_locks: CodeLocks,
    failing_usage_writes: Arc<std::sync::Mutex<HashSet<Uuid>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_server(&self, server: MediaServer) -> MediaServer {
        self.state.lock().await.servers.push(server.clone());
        server
    }

    pub async fn add_library(&self, library: Library) -> Library {
        self.state.lock().await.libraries.push(library.clone());
        library
    }

    /// Insert an invitation associated with the given servers.
    pub async fn add_invitation(&self, invitation: Invitation, server_ids: &[Uuid]) -> Invitation {
        let mut state = self.state.lock().await;
        state
            .invitation_servers
            .insert(invitation.id, server_ids.to_vec());
        state.invitations.push(invitation.clone());
        invitation
    }

    pub async fn restrict_libraries(&self, invitation_id: Uuid, library_ids: &[Uuid]) {
        self.state
            .lock()
            .await
            .invitation_libraries
            .insert(invitation_id, library_ids.to_vec());
    }

    pub async fn remove_invitation(&self, invitation_id: Uuid) {
        let mut state = self.state.lock().await;
        state.invitations.retain(|i| i.id != invitation_id);
        state.invitation_servers.remove(&invitation_id);
    }

    /// Make every usage write for `server_id` fail, simulating a database
    /// error in the middle of a server's bookkeeping.
    pub fn fail_usage_writes_for(&self, server_id: Uuid) {
        if let Ok(mut failing) = self.failing_usage_writes.lock() {
            failing.insert(server_id);
        }
    }

    pub async fn invitation(&self, code: &str) -> Option<Invitation> {
        let state = self.state.lock().await;
        state.invitations.iter().find(|i| i.matches_code(code)).cloned()
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn identities(&self) -> Vec<Identity> {
        self.state.lock().await.identities.clone()
    }

    pub async fn usages(&self) -> Vec<ServerUsage> {
        self.state.lock().await.usages.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn sessions(&self) -> Vec<DelegatedSession> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    /// Number of codes with a live or awaited lease.
    pub fn locked_code_count(&self) -> usize {
        self.code_locks.lock().map(|l| l.len()).unwrap_or_default()
    }

    fn code_lock(&self, code: &str) -> Result<Arc<Mutex<()>>, StoreError> {
        let mut locks = self
            .code_locks
            .lock()
            .map_err(|_| StoreError::Unavailable("code lock table poisoned".to_string()))?;
        Ok(locks.entry(normalize_code(code)).or_default().clone())
    }
}

#[async_trait::async_trait]
impl InvitationStore for InMemoryStore {
    async fn find_invitation(&self, code: &str) -> Result<Option<Invitation>, StoreError> {
        Ok(self.invitation(code).await)
    }

    async fn associated_servers(&self, invitation_id: Uuid) -> Result<Vec<MediaServer>, StoreError> {
        let state = self.state.lock().await;
        let ids = state
            .invitation_servers
            .get(&invitation_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.servers.iter().find(|s| s.id == *id).cloned())
            .collect())
    }

    async fn find_server(&self, server_id: Uuid) -> Result<Option<MediaServer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.servers.iter().find(|s| s.id == server_id).cloned())
    }

    async fn first_server(&self) -> Result<Option<MediaServer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.servers.first().cloned())
    }

    async fn invitation_libraries(&self, invitation_id: Uuid) -> Result<Vec<Library>, StoreError> {
        let state = self.state.lock().await;
        let ids = state
            .invitation_libraries
            .get(&invitation_id)
            .cloned()
            .unwrap_or_default();
        Ok(state
            .libraries
            .iter()
            .filter(|l| ids.contains(&l.id))
            .cloned()
            .collect())
    }

    async fn server_usages(&self, invitation_id: Uuid) -> Result<Vec<ServerUsage>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .usages
            .iter()
            .filter(|u| u.invitation_id == invitation_id)
            .cloned()
            .collect())
    }

    async fn lock_code(&self, code: &str) -> Result<Box<dyn CodeLease>, StoreError> {
        let guard = self.code_lock(code)?.lock_owned().await;
        Ok(Box::new(MemoryLease {
            code: normalize_code(code),
            guard: Some(guard),
            locks: self.code_locks.clone(),
        }))
    }

    async fn begin(&self) -> Result<Box<dyn RedemptionTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        let failing = self
            .failing_usage_writes
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            failing_usage_writes: failing,
        }))
    }

    async fn save_session(&self, session: &DelegatedSession) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.key_hash.clone(), session.clone());
        Ok(())
    }

    async fn take_session(&self, key_hash: &str) -> Result<Option<DelegatedSession>, StoreError> {
        Ok(self.state.lock().await.sessions.remove(key_hash))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryLease {
    code: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: CodeLocks,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        // The guard holds a reference to the mutex; drop it before counting.
        self.guard.take();
        if let Ok(mut locks) = self.locks.lock() {
            if locks
                .get(&self.code)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&self.code);
            }
        }
    }
}

#[async_trait::async_trait]
impl CodeLease for MemoryLease {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    failing_usage_writes: HashSet<Uuid>,
}

#[async_trait::async_trait]
impl RedemptionTx for MemoryTx {
    async fn lock_invitation(&mut self, invitation_id: Uuid) -> Result<Option<Invitation>, StoreError> {
        Ok(self
            .working
            .invitations
            .iter()
            .find(|i| i.id == invitation_id)
            .cloned())
    }

    async fn accounts_for_code(&mut self, code: &str) -> Result<Vec<Account>, StoreError> {
        let mut accounts: Vec<Account> = self
            .working
            .accounts
            .iter()
            .filter(|a| a.code.eq_ignore_ascii_case(code))
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn find_identity(&mut self, identity_id: Uuid) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .working
            .identities
            .iter()
            .find(|i| i.id == identity_id)
            .cloned())
    }

    async fn insert_identity(&mut self, identity: NewIdentity) -> Result<Identity, StoreError> {
        let identity = Identity {
            id: Uuid::new_v4(),
            primary_email: identity.primary_email,
            primary_username: identity.primary_username,
            created_at: Utc::now(),
        };
        self.working.identities.push(identity.clone());
        Ok(identity)
    }

    async fn set_account_identity(
        &mut self,
        account_id: Uuid,
        identity_id: Uuid,
    ) -> Result<(), StoreError> {
        if let Some(account) = self
            .working
            .accounts
            .iter_mut()
            .find(|a| a.id == account_id)
        {
            account.identity_id = Some(identity_id);
        }
        Ok(())
    }

    async fn insert_account(
        &mut self,
        account: &NewAccount,
        identity_id: Option<Uuid>,
    ) -> Result<Account, StoreError> {
        let account = Account {
            id: Uuid::new_v4(),
            username: account.username.clone(),
            email: account.email.clone(),
            remote_id: account.remote_id.clone(),
            server_id: account.server_id,
            code: account.code.clone(),
            identity_id,
            expires: account.expires,
            created_at: Utc::now(),
        };
        self.working.accounts.push(account.clone());
        Ok(account)
    }

    async fn upsert_server_usage(
        &mut self,
        invitation_id: Uuid,
        server_id: Uuid,
        account_id: Uuid,
        used_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if self.failing_usage_writes.contains(&server_id) {
            return Err(StoreError::Unavailable(
                "simulated usage write failure".to_string(),
            ));
        }
        let exists = self
            .working
            .usages
            .iter()
            .any(|u| u.invitation_id == invitation_id && u.server_id == server_id);
        if exists {
            return Ok(false);
        }
        self.working.usages.push(ServerUsage {
            invitation_id,
            server_id,
            account_id: Some(account_id),
            used_at,
        });
        Ok(true)
    }

    async fn server_usages(&mut self, invitation_id: Uuid) -> Result<Vec<ServerUsage>, StoreError> {
        Ok(self
            .working
            .usages
            .iter()
            .filter(|u| u.invitation_id == invitation_id)
            .cloned()
            .collect())
    }

    async fn update_invitation_usage(
        &mut self,
        invitation_id: Uuid,
        state: UsageState,
    ) -> Result<(), StoreError> {
        if let Some(invitation) = self
            .working
            .invitations
            .iter_mut()
            .find(|i| i.id == invitation_id)
        {
            invitation.used = state.used;
            invitation.used_at = state.used_at;
            invitation.used_by = state.used_by;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServerType;

    #[tokio::test]
    async fn test_find_invitation_case_insensitive() {
        let store = InMemoryStore::new();
        store.add_invitation(Invitation::new("ABC123"), &[]).await;

        assert!(store.find_invitation("abc123").await.unwrap().is_some());
        assert!(store.find_invitation("XYZ999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_associated_servers_keep_order() {
        let store = InMemoryStore::new();
        let a = store
            .add_server(MediaServer::new("A", ServerType::Jellyfin, "http://a"))
            .await;
        let b = store
            .add_server(MediaServer::new("B", ServerType::Plex, "http://b"))
            .await;
        let invitation = store
            .add_invitation(Invitation::new("ABC123"), &[b.id, a.id])
            .await;

        let servers = store.associated_servers(invitation.id).await.unwrap();
        let names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
        assert_eq!(store.first_server().await.unwrap().unwrap().name, "A");
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_discarded() {
        let store = InMemoryStore::new();
        let server = store
            .add_server(MediaServer::new("A", ServerType::Jellyfin, "http://a"))
            .await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_account(
                &NewAccount {
                    username: "alice".to_string(),
                    email: None,
                    remote_id: None,
                    server_id: server.id,
                    code: "ABC123".to_string(),
                    expires: None,
                },
                None,
            )
            .await
            .unwrap();
        }
        assert!(store.accounts().await.is_empty());
    }

    #[tokio::test]
    async fn test_committed_transaction_is_visible() {
        let store = InMemoryStore::new();
        let invitation = store.add_invitation(Invitation::new("ABC123"), &[]).await;
        let server_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .upsert_server_usage(invitation.id, server_id, account_id, Utc::now())
            .await
            .unwrap());
        assert!(!tx
            .upsert_server_usage(invitation.id, server_id, account_id, Utc::now())
            .await
            .unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.usages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_single_use() {
        let store = InMemoryStore::new();
        let session = DelegatedSession {
            key_hash: "hash".to_string(),
            invitation_id: Uuid::new_v4(),
            code: "ABC123".to_string(),
            attempt: Default::default(),
            results: Vec::new(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        store.save_session(&session).await.unwrap();
        assert!(store.take_session("hash").await.unwrap().is_some());
        assert!(store.take_session("hash").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_code_lock_serializes_same_code() {
        let store = Arc::new(InMemoryStore::new());
        let lease = store.lock_code("abc123").await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let lease = store.lock_code("ABC123").await.unwrap();
                lease.release().await.unwrap();
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // A different code is not blocked.
        let other = store.lock_code("XYZ789").await.unwrap();
        other.release().await.unwrap();

        lease.release().await.unwrap();
        contender.await.unwrap();
        assert_eq!(store.locked_code_count(), 0);
    }

    #[tokio::test]
    async fn test_released_code_locks_are_pruned() {
        let store = InMemoryStore::new();
        for i in 0..50 {
            let lease = store.lock_code(&format!("CODE{:02}", i)).await.unwrap();
            assert_eq!(store.locked_code_count(), 1);
            lease.release().await.unwrap();
        }
        assert_eq!(store.locked_code_count(), 0);

        // A dropped lease is pruned just like a released one.
        let lease = store.lock_code("ABC123").await.unwrap();
        drop(lease);
        assert_eq!(store.locked_code_count(), 0);
    }
}
