//! Sequential account provisioning across the servers of one redemption.
//!
//! Each server is attempted independently and in order. A successful remote
//! account is recorded locally in its own transaction before the next server
//! starts, so identity state from one server is visible to the next.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::backend::{
    BackendError, BackendRegistry, MediaBackend, ProvisionOutcome, ProvisionRequest,
    TokenProvisionRequest,
};
use super::identity_linker::{self, Linked};
use super::resolver::ResolvedServer;
use super::store::{InvitationStore, StoreError};
use super::usage_tracker;
use crate::models::{
    non_blank, Account, AttemptAccount, CredentialForm, Invitation, Library, NewAccount,
    PerServerResult, RedemptionAttempt,
};

/// What the user supplied to authenticate the new accounts.
#[derive(Clone, Copy)]
pub enum AuthMaterial<'a> {
    Credentials(&'a CredentialForm),
    Token(&'a str),
}

/// Runs provisioning for a list of servers.
pub struct Provisioner<'a> {
    store: &'a dyn InvitationStore,
    registry: &'a BackendRegistry,
    timeout: Duration,
}

impl<'a> Provisioner<'a> {
    pub fn new(store: &'a dyn InvitationStore, registry: &'a BackendRegistry, timeout: Duration) -> Self {
        Self {
            store,
            registry,
            timeout,
        }
    }

    /// Provision every server in order, returning one result per server.
    ///
    /// `target_servers` are all servers the invitation covers; they decide
    /// when a limited invitation becomes used.
    pub async fn provision(
        &self,
        invitation: &Invitation,
        target_servers: &[Uuid],
        servers: &[ResolvedServer],
        material: AuthMaterial<'_>,
        libraries: &[Library],
        attempt: &mut RedemptionAttempt,
    ) -> Vec<PerServerResult> {
        let mut results = Vec::with_capacity(servers.len());
        for server in servers {
            let result = self
                .provision_one(invitation, target_servers, server, material, libraries, attempt)
                .await;
            results.push(result);
        }
        results
    }

    async fn provision_one(
        &self,
        invitation: &Invitation,
        target_servers: &[Uuid],
        resolved: &ResolvedServer,
        material: AuthMaterial<'_>,
        libraries: &[Library],
        attempt: &mut RedemptionAttempt,
    ) -> PerServerResult {
        let server = &resolved.server;

        let backend = match self.registry.connect(resolved.server_type, server) {
            Ok(backend) => backend,
            Err(err) => {
                tracing::warn!(server_id = %server.id, error = %err, "Failed to connect to backend");
                return failure(resolved, err.to_string());
            }
        };

        let requested: Vec<String> = libraries
            .iter()
            .filter(|l| l.server_id == server.id)
            .map(|l| l.external_id.clone())
            .collect();
        let libraries = self.available_libraries(&backend, resolved, requested).await;
        let expires = invitation.account_expiry(Utc::now());

        let call = async {
            match material {
                AuthMaterial::Credentials(form) => {
                    backend
                        .provision(&ProvisionRequest {
                            username: form.username.clone(),
                            password: form.password.clone(),
                            confirm: form.confirm_password.clone(),
                            email: form.email.clone(),
                            invitation_code: invitation.code.clone(),
                            libraries,
                            expires,
                        })
                        .await
                }
                AuthMaterial::Token(token) => {
                    backend
                        .provision_with_token(&TokenProvisionRequest {
                            token: token.to_string(),
                            invitation_code: invitation.code.clone(),
                            libraries,
                            expires,
                        })
                        .await
                }
            }
        };

        let outcome = match self.bounded(call).await {
            Ok(outcome) if outcome.ok => outcome,
            Ok(outcome) => {
                tracing::warn!(
                    server_id = %server.id,
                    code = %invitation.code,
                    message = %outcome.message,
                    "Backend rejected account"
                );
                return failure(resolved, outcome.message);
            }
            Err(err) => {
                tracing::warn!(
                    server_id = %server.id,
                    code = %invitation.code,
                    error = %err,
                    "Provisioning failed"
                );
                return failure(resolved, err.to_string());
            }
        };

        let new_account = local_account(invitation, resolved, material, &outcome, expires);
        if let AuthMaterial::Token(_) = material {
            if attempt.verified_email.is_none() {
                attempt.verified_email = new_account.usable_email().map(str::to_string);
            }
        }

        match self.record(invitation, target_servers, &new_account, attempt).await {
            Ok((account, linked)) => {
                tracing::info!(
                    server_id = %server.id,
                    account_id = %account.id,
                    code = %invitation.code,
                    "Account provisioned"
                );
                attempt.accounts.push(AttemptAccount {
                    account_id: account.id,
                    server_id: server.id,
                    username: account.username.clone(),
                    email: account.email.clone(),
                    identity_id: account.identity_id,
                });
                if let Some(linked) = linked {
                    attempt.assign_identity(&linked.linked_accounts, linked.identity.id);
                }
                PerServerResult {
                    server_id: server.id,
                    server_name: server.name.clone(),
                    server_type: Some(resolved.server_type),
                    success: true,
                    message: outcome.message,
                }
            }
            Err(err) => {
                tracing::error!(
                    server_id = %server.id,
                    code = %invitation.code,
                    error = %err,
                    "Failed to record provisioned account, transaction rolled back"
                );
                failure(
                    resolved,
                    format!("Account was created but could not be recorded: {}", err),
                )
            }
        }
    }

    /// Link, insert and mark used in one transaction.
    async fn record(
        &self,
        invitation: &Invitation,
        target_servers: &[Uuid],
        new_account: &NewAccount,
        attempt: &RedemptionAttempt,
    ) -> Result<(Account, Option<Linked>), StoreError> {
        let mut tx = self.store.begin().await?;

        let Some(current) = tx.lock_invitation(invitation.id).await? else {
            tracing::warn!(code = %invitation.code, "Invitation vanished, recording account without identity");
            let account = tx.insert_account(new_account, None).await?;
            tx.commit().await?;
            return Ok((account, None));
        };

        let existing = tx.accounts_for_code(&current.code).await?;
        let decision = identity_linker::decide(Some(&current), &existing, new_account, attempt);
        let linked = identity_linker::link_or_create(tx.as_mut(), decision).await?;

        let account = tx
            .insert_account(new_account, linked.as_ref().map(|l| l.identity.id))
            .await?;
        usage_tracker::mark_used(
            tx.as_mut(),
            &current,
            target_servers,
            new_account.server_id,
            account.id,
            Utc::now(),
        )
        .await?;

        tx.commit().await?;
        Ok((account, linked))
    }

    /// Requested library ids the backend still knows about. When the
    /// library listing fails the request is passed through unchanged.
    async fn available_libraries(
        &self,
        backend: &Arc<dyn MediaBackend>,
        resolved: &ResolvedServer,
        requested: Vec<String>,
    ) -> Vec<String> {
        if requested.is_empty() {
            return requested;
        }
        match self.bounded(backend.list_libraries()).await {
            Ok(available) => {
                let (known, stale): (Vec<_>, Vec<_>) =
                    requested.into_iter().partition(|id| available.contains_key(id));
                if !stale.is_empty() {
                    tracing::warn!(
                        server_id = %resolved.server.id,
                        stale = ?stale,
                        "Ignoring libraries no longer present on server"
                    );
                }
                known
            }
            Err(err) => {
                tracing::warn!(
                    server_id = %resolved.server.id,
                    error = %err,
                    "Could not list libraries, passing restrictions unchecked"
                );
                requested
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout.as_secs()))?
    }
}

fn local_account(
    invitation: &Invitation,
    resolved: &ResolvedServer,
    material: AuthMaterial<'_>,
    outcome: &ProvisionOutcome,
    expires: Option<chrono::DateTime<Utc>>,
) -> NewAccount {
    let remote = outcome.account.as_ref();
    let remote_id = remote.and_then(|a| a.remote_id.clone());
    let remote_email = remote.and_then(|a| non_blank(a.email.as_deref())).map(str::to_string);

    let (username, email) = match material {
        AuthMaterial::Credentials(form) => (form.username.clone(), form.email.clone()),
        AuthMaterial::Token(_) => {
            let username = remote
                .and_then(|a| non_blank(a.username.as_deref()))
                .map(str::to_string)
                .or_else(|| remote_email.clone())
                .unwrap_or_else(|| format!("{}-{}", resolved.server_type, invitation.code));
            (username, remote_email)
        }
    };

    NewAccount {
        username,
        email,
        remote_id,
        server_id: resolved.server.id,
        code: invitation.code.clone(),
        expires,
    }
}

fn failure(resolved: &ResolvedServer, message: String) -> PerServerResult {
    PerServerResult {
        server_id: resolved.server.id,
        server_name: resolved.server.name.clone(),
        server_type: Some(resolved.server_type),
        success: false,
        message,
    }
}
