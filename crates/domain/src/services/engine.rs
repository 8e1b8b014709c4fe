//! Redemption engine.
//!
//! Ties validation, server resolution, workflow selection, provisioning and
//! aggregation together behind the two inbound operations: [`display`] and
//! [`submit`].
//!
//! [`display`]: RedemptionEngine::display
//! [`submit`]: RedemptionEngine::submit

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use super::aggregator::{aggregate, summarize};
use super::backend::BackendRegistry;
use super::provisioner::{AuthMaterial, Provisioner};
use super::resolver::{pending_servers, resolve, ResolveError, ResolvedServer};
use super::store::{InvitationStore, StoreError};
use super::validator::{validate_shape, validate_state};
use super::workflow::Workflow;
use crate::models::{
    describe_validation_errors, fields, non_blank, CodeBounds, CredentialForm,
    DelegatedSession, DisplayResult, DisplayStatus, InvalidReason, Invitation, Library,
    PerServerResult, RedemptionAttempt, RedirectHint, SubmissionResult, TemplateHint, Validation,
};

/// Default lifetime of a hybrid session between its two phases.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);

/// Default bound on a single backend call.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(30);

/// Infrastructure failures that prevent the engine from answering.
///
/// Everything the user can cause is reported inside the result types.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub code_bounds: CodeBounds,
    pub session_ttl: Duration,
    pub provision_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            code_bounds: CodeBounds::default(),
            session_ttl: DEFAULT_SESSION_TTL,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }
}

/// A redeemable invitation with the servers it still targets.
struct Redeemable {
    invitation: Invitation,
    targets: Vec<Uuid>,
    pending: Vec<ResolvedServer>,
}

enum Prepared {
    Ready(Redeemable),
    Invalid(InvalidReason),
    Unavailable(String),
}

pub struct RedemptionEngine {
    store: Arc<dyn InvitationStore>,
    registry: Arc<BackendRegistry>,
    config: EngineConfig,
}

impl RedemptionEngine {
    pub fn new(
        store: Arc<dyn InvitationStore>,
        registry: Arc<BackendRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate a code without resolving its servers.
    pub async fn validate(&self, code: &str) -> Result<Validation, EngineError> {
        let code = match validate_shape(code, &self.config.code_bounds) {
            Ok(code) => code,
            Err(reason) => return Ok(Validation::invalid(reason)),
        };
        let invitation = self.store.find_invitation(&code).await?;
        Ok(match validate_state(invitation.as_ref(), Utc::now()) {
            Ok(_) => Validation::valid(),
            Err(reason) => Validation::invalid(reason),
        })
    }

    pub async fn is_valid(&self, code: &str) -> Result<bool, EngineError> {
        Ok(self.validate(code).await?.valid)
    }

    /// Describe what redeeming `code` would involve.
    pub async fn display(&self, code: &str) -> Result<DisplayResult, EngineError> {
        let code = match validate_shape(code, &self.config.code_bounds) {
            Ok(code) => code,
            Err(reason) => return Ok(DisplayResult::invalid(reason)),
        };

        let redeemable = match self.prepare(&code).await? {
            Prepared::Ready(redeemable) => redeemable,
            Prepared::Invalid(reason) => return Ok(DisplayResult::invalid(reason)),
            Prepared::Unavailable(message) => {
                return Ok(DisplayResult {
                    status: DisplayStatus::Unavailable,
                    reason: None,
                    message: Some(message),
                    template_hint: TemplateHint::CredentialForm,
                    servers: Vec::new(),
                })
            }
        };

        let servers = redeemable.pending.iter().map(|s| s.summary()).collect();
        let workflow = Workflow::select(redeemable.pending);
        Ok(DisplayResult {
            status: DisplayStatus::Valid,
            reason: None,
            message: None,
            template_hint: workflow.template_hint(),
            servers,
        })
    }

    /// Redeem a code from submitted form fields.
    ///
    /// The whole attempt runs inside the code's critical section, so two
    /// submissions of the same code never interleave.
    pub async fn submit(
        &self,
        form_fields: &HashMap<String, String>,
    ) -> Result<SubmissionResult, EngineError> {
        let raw_code = form_fields
            .get(fields::CODE)
            .map(String::as_str)
            .unwrap_or_default();
        let code = match validate_shape(raw_code, &self.config.code_bounds) {
            Ok(code) => code,
            Err(reason) => return Ok(SubmissionResult::rejected(reason.message())),
        };

        let lease = self.store.lock_code(&code).await?;
        let result = self.submit_locked(&code, form_fields).await;
        if let Err(err) = lease.release().await {
            tracing::warn!(code = %code, error = %err, "Failed to release code lock");
        }

        let result = result?;
        tracing::info!(
            code = %code,
            status = %result.status,
            successful = result.successful.len(),
            failed = result.failed.len(),
            "Redemption finished"
        );
        Ok(result)
    }

    async fn submit_locked(
        &self,
        code: &str,
        form_fields: &HashMap<String, String>,
    ) -> Result<SubmissionResult, EngineError> {
        let redeemable = match self.prepare(code).await? {
            Prepared::Ready(redeemable) => redeemable,
            Prepared::Invalid(reason) => return Ok(SubmissionResult::rejected(reason.message())),
            Prepared::Unavailable(message) => return Ok(SubmissionResult::rejected(message)),
        };
        let libraries = self
            .store
            .invitation_libraries(redeemable.invitation.id)
            .await?;

        if let Some(session) = non_blank(form_fields.get(fields::SESSION).map(String::as_str)) {
            return self
                .complete_hybrid(&redeemable, session, form_fields, &libraries)
                .await;
        }

        let provisioner = self.provisioner();
        let invitation = &redeemable.invitation;
        let targets = &redeemable.targets;
        let mut attempt = RedemptionAttempt::default();

        let workflow = Workflow::select(redeemable.pending.clone());
        tracing::debug!(code = %code, workflow = workflow.name(), "Workflow selected");

        match workflow {
            Workflow::FormBased { servers } => {
                let form = match checked_form(form_fields) {
                    Ok(form) => form,
                    Err(rejected) => return Ok(rejected),
                };
                let results = provisioner
                    .provision(
                        invitation,
                        targets,
                        &servers,
                        AuthMaterial::Credentials(&form),
                        &libraries,
                        &mut attempt,
                    )
                    .await;
                Ok(summarize(results))
            }
            Workflow::DelegatedToken { servers } => {
                let Some(token) = token(form_fields) else {
                    return Ok(SubmissionResult::rejected(MISSING_TOKEN));
                };
                let results = provisioner
                    .provision(
                        invitation,
                        targets,
                        &servers,
                        AuthMaterial::Token(token),
                        &libraries,
                        &mut attempt,
                    )
                    .await;
                Ok(summarize(results))
            }
            Workflow::Hybrid { token_servers, .. } => {
                let Some(token) = token(form_fields) else {
                    return Ok(SubmissionResult::rejected(MISSING_TOKEN));
                };
                let results = provisioner
                    .provision(
                        invitation,
                        targets,
                        &token_servers,
                        AuthMaterial::Token(token),
                        &libraries,
                        &mut attempt,
                    )
                    .await;
                if !results.iter().any(|r| r.success) {
                    return Ok(summarize(results));
                }
                self.start_form_phase(invitation, attempt, results)
                    .await
            }
        }
    }

    /// Store the delegated phase and hand the client a correlation id.
    async fn start_form_phase(
        &self,
        invitation: &Invitation,
        attempt: RedemptionAttempt,
        results: Vec<PerServerResult>,
    ) -> Result<SubmissionResult, EngineError> {
        let key = shared::crypto::generate_session_key();
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_SESSION_TTL.as_secs() as i64));
        let session = DelegatedSession {
            key_hash: shared::crypto::sha256_hex(&key),
            invitation_id: invitation.id,
            code: invitation.code.clone(),
            attempt,
            results: results.clone(),
            created_at: now,
            expires_at: now + ttl,
        };
        self.store.save_session(&session).await?;
        tracing::info!(code = %invitation.code, "Delegated phase complete, awaiting account form");

        let status = aggregate(&results);
        let (successful, failed) = results.into_iter().partition(|r| r.success);
        Ok(SubmissionResult {
            status,
            successful,
            failed,
            redirect_hint: RedirectHint::ContinueWithForm { session: key },
            message: Some("Continue with the account form".to_string()),
        })
    }

    /// Second phase of a hybrid redemption.
    async fn complete_hybrid(
        &self,
        redeemable: &Redeemable,
        session_key: &str,
        form_fields: &HashMap<String, String>,
        libraries: &[Library],
    ) -> Result<SubmissionResult, EngineError> {
        let form = match checked_form(form_fields) {
            Ok(form) => form,
            Err(rejected) => return Ok(rejected),
        };

        let key_hash = shared::crypto::sha256_hex(session_key);
        let session = match self.store.take_session(&key_hash).await? {
            Some(session)
                if session.invitation_id == redeemable.invitation.id
                    && !session.is_expired_at(Utc::now()) =>
            {
                session
            }
            _ => return Ok(SubmissionResult::rejected(INVALID_SESSION)),
        };

        let form_servers = Workflow::select(redeemable.pending.clone()).into_form_servers();

        let mut attempt = session.attempt;
        let mut results = session.results;
        let phase_two = self
            .provisioner()
            .provision(
                &redeemable.invitation,
                &redeemable.targets,
                &form_servers,
                AuthMaterial::Credentials(&form),
                libraries,
                &mut attempt,
            )
            .await;
        results.extend(phase_two);
        Ok(summarize(results))
    }

    /// Look up, validate and resolve a normalized code.
    async fn prepare(&self, code: &str) -> Result<Prepared, EngineError> {
        let invitation = self.store.find_invitation(code).await?;
        let invitation = match validate_state(invitation.as_ref(), Utc::now()) {
            Ok(invitation) => invitation.clone(),
            Err(reason) => return Ok(Prepared::Invalid(reason)),
        };

        let resolved = match resolve(self.store.as_ref(), &self.registry, &invitation).await {
            Ok(resolved) => resolved,
            Err(ResolveError::Store(err)) => return Err(err.into()),
            Err(err) => {
                tracing::warn!(code = %code, error = %err, "Invitation cannot be resolved");
                return Ok(Prepared::Unavailable(err.to_string()));
            }
        };

        let usages = self.store.server_usages(invitation.id).await?;
        let pending = pending_servers(&resolved, &usages, invitation.unlimited);
        if pending.is_empty() {
            return Ok(Prepared::Invalid(InvalidReason::AlreadyUsed));
        }

        Ok(Prepared::Ready(Redeemable {
            targets: resolved.iter().map(|s| s.server.id).collect(),
            invitation,
            pending,
        }))
    }

    fn provisioner(&self) -> Provisioner<'_> {
        Provisioner::new(
            self.store.as_ref(),
            &self.registry,
            self.config.provision_timeout,
        )
    }
}

const MISSING_TOKEN: &str = "A delegated login token is required";
const INVALID_SESSION: &str = "The login session is invalid or has expired";

fn token(form_fields: &HashMap<String, String>) -> Option<&str> {
    non_blank(form_fields.get(fields::TOKEN).map(String::as_str))
}

fn checked_form(form_fields: &HashMap<String, String>) -> Result<CredentialForm, SubmissionResult> {
    let form = CredentialForm::from_fields(form_fields);
    match form.validate() {
        Ok(()) => Ok(form),
        Err(errors) => Err(SubmissionResult::rejected(describe_validation_errors(&errors))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaServer, RedemptionStatus, ServerType};
    use crate::services::backend::{MockBackend, MockConnector};
    use crate::services::memory_store::InMemoryStore;
    use chrono::Duration as ChronoDuration;

    struct Harness {
        store: Arc<InMemoryStore>,
        connector: Arc<MockConnector>,
        engine: RedemptionEngine,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let connector = Arc::new(MockConnector::new());
            let registry = ServerType::ALL
                .into_iter()
                .fold(BackendRegistry::new(), |r, t| r.with(t, connector.clone()));
            let engine = RedemptionEngine::new(
                store.clone(),
                Arc::new(registry),
                EngineConfig {
                    provision_timeout: Duration::from_secs(2),
                    ..EngineConfig::default()
                },
            );
            Self {
                store,
                connector,
                engine,
            }
        }

        async fn server(&self, name: &str, server_type: ServerType, backend: MockBackend) -> MediaServer {
            let server = self
                .store
                .add_server(MediaServer::new(name, server_type, "http://server"))
                .await;
            self.connector.insert(server.id, backend);
            server
        }

        async fn invitation(&self, invitation: Invitation, servers: &[&MediaServer]) -> Invitation {
            let ids: Vec<Uuid> = servers.iter().map(|s| s.id).collect();
            self.store.add_invitation(invitation, &ids).await
        }
    }

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn form_fields(code: &str, username: &str, email: &str) -> HashMap<String, String> {
        fields(&[
            ("code", code),
            ("username", username),
            ("password", "correct-horse"),
            ("confirm_password", "correct-horse"),
            ("email", email),
        ])
    }

    fn unlimited(code: &str) -> Invitation {
        let mut invitation = Invitation::new(code);
        invitation.unlimited = true;
        invitation
    }

    #[tokio::test]
    async fn test_validate_expired_code() {
        let h = Harness::new();
        let mut invitation = Invitation::new("ABC123");
        invitation.expires = Some(Utc::now() - ChronoDuration::hours(1));
        h.invitation(invitation, &[]).await;

        let validation = h.engine.validate("ABC123").await.unwrap();
        assert_eq!(validation, Validation::invalid(InvalidReason::Expired));
    }

    #[tokio::test]
    async fn test_validate_reused_limited_code() {
        let h = Harness::new();
        let mut invitation = Invitation::new("ABC123");
        invitation.used = true;
        h.invitation(invitation, &[]).await;

        let validation = h.engine.validate("abc123").await.unwrap();
        assert_eq!(validation, Validation::invalid(InvalidReason::AlreadyUsed));
    }

    #[tokio::test]
    async fn test_validate_malformed_codes() {
        let h = Harness::new();
        assert_eq!(
            h.engine.validate("AB").await.unwrap().reason,
            Some(InvalidReason::InvalidLength)
        );
        assert_eq!(
            h.engine.validate("ABC-12").await.unwrap().reason,
            Some(InvalidReason::NotFound)
        );
        assert_eq!(
            h.engine.validate("ZZZZZZ").await.unwrap().reason,
            Some(InvalidReason::NotFound)
        );
    }

    #[tokio::test]
    async fn test_limited_single_server_invalid_after_use() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::accepting()).await;
        h.invitation(Invitation::new("ABC123"), &[&jf]).await;

        let result = h
            .engine
            .submit(&form_fields("ABC123", "alice", ""))
            .await
            .unwrap();
        assert_eq!(result.status, RedemptionStatus::Success);
        assert_eq!(result.redirect_hint, RedirectHint::Completed);
        assert!(!h.engine.is_valid("ABC123").await.unwrap());

        let again = h
            .engine
            .submit(&form_fields("ABC123", "bob", ""))
            .await
            .unwrap();
        assert_eq!(again.status, RedemptionStatus::Failure);
        assert_eq!(again.attempted(), 0);
    }

    #[tokio::test]
    async fn test_unlimited_stays_valid_without_false_linking() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::accepting()).await;
        h.invitation(unlimited("OPEN42"), &[&jf]).await;

        for (name, email) in [("alice", "alice@example.com"), ("bob", "bob@example.com")] {
            let result = h
                .engine
                .submit(&form_fields("OPEN42", name, email))
                .await
                .unwrap();
            assert_eq!(result.status, RedemptionStatus::Success);
            assert!(h.engine.is_valid("OPEN42").await.unwrap());
        }

        let accounts = h.store.accounts().await;
        assert_eq!(accounts.len(), 2);
        assert!(accounts.iter().all(|a| a.identity_id.is_none()));
        assert!(h.store.identities().await.is_empty());

        let stored = h.store.invitation("OPEN42").await.unwrap();
        assert!(stored.used);
        assert_eq!(stored.used_by, Some(accounts[0].id));
    }

    #[tokio::test]
    async fn test_limited_multi_server_links_accounts() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::accepting()).await;
        let emby = h.server("Emby", ServerType::Emby, MockBackend::accepting()).await;
        h.invitation(Invitation::new("ABC123"), &[&jf, &emby]).await;

        let result = h
            .engine
            .submit(&form_fields("ABC123", "alice", ""))
            .await
            .unwrap();
        assert_eq!(result.status, RedemptionStatus::Success);

        let accounts = h.store.accounts().await;
        assert_eq!(accounts.len(), 2);
        assert!(accounts[0].identity_id.is_some());
        assert_eq!(accounts[0].identity_id, accounts[1].identity_id);
        assert_eq!(h.store.identities().await.len(), 1);
        assert_eq!(h.store.usages().await.len(), 2);
        assert!(h.store.invitation("ABC123").await.unwrap().used);
    }

    #[tokio::test]
    async fn test_partial_success_then_retry_targets_remaining_server() {
        let h = Harness::new();
        let one = h.server("One", ServerType::Jellyfin, MockBackend::accepting()).await;
        let two = h
            .server("Two", ServerType::Emby, MockBackend::failing("connection refused"))
            .await;
        let three = h.server("Three", ServerType::Navidrome, MockBackend::accepting()).await;
        h.invitation(Invitation::new("ABC123"), &[&one, &two, &three])
            .await;

        let result = h
            .engine
            .submit(&form_fields("ABC123", "alice", ""))
            .await
            .unwrap();
        assert_eq!(result.status, RedemptionStatus::PartialSuccess);
        assert_eq!(result.successful.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].server_name, "Two");
        assert!(h.engine.is_valid("ABC123").await.unwrap());

        let display = h.engine.display("ABC123").await.unwrap();
        assert_eq!(display.status, DisplayStatus::Valid);
        assert_eq!(display.servers.len(), 1);
        assert_eq!(display.servers[0].name, "Two");
    }

    #[tokio::test]
    async fn test_all_servers_fail() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::rejecting("User exists")).await;
        let emby = h.server("Emby", ServerType::Emby, MockBackend::rejecting("User exists")).await;
        h.invitation(Invitation::new("ABC123"), &[&jf, &emby]).await;

        let result = h
            .engine
            .submit(&form_fields("ABC123", "alice", ""))
            .await
            .unwrap();
        assert_eq!(result.status, RedemptionStatus::Failure);
        assert_eq!(result.failed.len(), 2);
        assert_eq!(result.redirect_hint, RedirectHint::Retry);
        assert!(h.store.usages().await.is_empty());
        assert!(h.store.identities().await.is_empty());
        assert!(h.engine.is_valid("ABC123").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_form_provisions_nothing() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::accepting()).await;
        h.invitation(Invitation::new("ABC123"), &[&jf]).await;

        let mut submitted = form_fields("ABC123", "alice", "");
        submitted.insert("confirm_password".to_string(), "different".to_string());
        let result = h.engine.submit(&submitted).await.unwrap();

        assert_eq!(result.status, RedemptionStatus::Failure);
        assert!(result.message.unwrap().contains("passwords do not match"));
        assert!(h.store.accounts().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_server_type_is_fatal() {
        let h = Harness::new();
        let mut server = MediaServer::new("Odd", ServerType::Jellyfin, "http://odd");
        server.server_type = "betamax".to_string();
        let server = h.store.add_server(server).await;
        h.invitation(Invitation::new("ABC123"), &[&server]).await;

        let display = h.engine.display("ABC123").await.unwrap();
        assert_eq!(display.status, DisplayStatus::Unavailable);

        let result = h
            .engine
            .submit(&form_fields("ABC123", "alice", ""))
            .await
            .unwrap();
        assert_eq!(result.status, RedemptionStatus::Failure);
        assert!(result.message.unwrap().contains("betamax"));
        assert!(h.store.accounts().await.is_empty());
    }

    #[tokio::test]
    async fn test_delegated_token_requires_token() {
        let h = Harness::new();
        let plex = h.server("Plex", ServerType::Plex, MockBackend::accepting()).await;
        h.invitation(Invitation::new("ABC123"), &[&plex]).await;

        let display = h.engine.display("ABC123").await.unwrap();
        assert_eq!(display.template_hint, TemplateHint::DelegatedLogin);

        let result = h.engine.submit(&fields(&[("code", "ABC123")])).await.unwrap();
        assert_eq!(result.message.as_deref(), Some(MISSING_TOKEN));

        let result = h
            .engine
            .submit(&fields(&[("code", "ABC123"), ("token", "plex-token")]))
            .await
            .unwrap();
        assert_eq!(result.status, RedemptionStatus::Success);
    }

    #[tokio::test]
    async fn test_hybrid_flow_shares_identity() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::accepting()).await;
        let plex = h
            .server(
                "Plex",
                ServerType::Plex,
                MockBackend::accepting().with_token_identity("alice_plex", "alice@example.com"),
            )
            .await;
        h.invitation(Invitation::new("ABC123"), &[&jf, &plex]).await;

        let display = h.engine.display("ABC123").await.unwrap();
        assert_eq!(display.template_hint, TemplateHint::DelegatedThenForm);
        assert_eq!(display.servers[0].name, "Plex");

        let phase_one = h
            .engine
            .submit(&fields(&[("code", "ABC123"), ("token", "plex-token")]))
            .await
            .unwrap();
        let RedirectHint::ContinueWithForm { session } = phase_one.redirect_hint else {
            panic!("expected continue_with_form");
        };
        assert_eq!(phase_one.successful.len(), 1);
        let stored = h.store.sessions().await;
        assert_eq!(stored.len(), 1);
        let persisted = serde_json::to_string(&stored[0]).unwrap();
        assert!(!persisted.contains("plex-token"));
        assert_eq!(stored[0].attempt.verified_email.as_deref(), Some("alice@example.com"));

        let mut phase_two = form_fields("ABC123", "alice", "alice@example.com");
        phase_two.insert("session".to_string(), session.clone());
        let result = h.engine.submit(&phase_two).await.unwrap();

        assert_eq!(result.status, RedemptionStatus::Success);
        assert_eq!(result.successful.len(), 2);
        assert_eq!(h.store.usages().await.len(), 2);
        assert_eq!(h.store.identities().await.len(), 1);
        let accounts = h.store.accounts().await;
        assert!(accounts[0].identity_id.is_some());
        assert_eq!(accounts[0].identity_id, accounts[1].identity_id);
        assert!(!h.engine.is_valid("ABC123").await.unwrap());
        assert_eq!(h.store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_unlimited_hybrid_links_on_verified_email_only() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::accepting()).await;
        let plex = h
            .server(
                "Plex",
                ServerType::Plex,
                MockBackend::accepting().with_token_identity("alice_plex", "alice@example.com"),
            )
            .await;
        h.invitation(unlimited("OPEN42"), &[&jf, &plex]).await;

        async fn redeem(h: &Harness, email: &str) {
            let phase_one = h
                .engine
                .submit(&fields(&[("code", "OPEN42"), ("token", "plex-token")]))
                .await
                .unwrap();
            let RedirectHint::ContinueWithForm { session } = phase_one.redirect_hint else {
                panic!("expected continue_with_form");
            };
            let mut phase_two = form_fields("OPEN42", "someone", email);
            phase_two.insert("session".to_string(), session);
            let result = h.engine.submit(&phase_two).await.unwrap();
            assert_eq!(result.status, RedemptionStatus::Success);
        }

        redeem(&h, "alice@example.com").await;
        redeem(&h, "other@example.com").await;

        let accounts = h.store.accounts().await;
        assert_eq!(accounts.len(), 4);
        assert_eq!(accounts[0].identity_id, accounts[1].identity_id);
        assert!(accounts[0].identity_id.is_some());
        assert_eq!(accounts[2].identity_id, None);
        assert_eq!(accounts[3].identity_id, None);
        assert_eq!(h.store.identities().await.len(), 1);
    }

    #[tokio::test]
    async fn test_hybrid_token_failure_skips_form_phase() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::accepting()).await;
        let plex = h
            .server("Plex", ServerType::Plex, MockBackend::rejecting("Invalid token"))
            .await;
        h.invitation(Invitation::new("ABC123"), &[&jf, &plex]).await;

        let result = h
            .engine
            .submit(&fields(&[("code", "ABC123"), ("token", "bad")]))
            .await
            .unwrap();
        assert_eq!(result.status, RedemptionStatus::Failure);
        assert_eq!(result.redirect_hint, RedirectHint::Retry);
        assert_eq!(h.store.session_count().await, 0);
        assert!(h.store.accounts().await.is_empty());
    }

    #[tokio::test]
    async fn test_session_is_single_use_and_bound_to_code() {
        let h = Harness::new();
        let jf = h.server("JF", ServerType::Jellyfin, MockBackend::accepting()).await;
        let plex = h
            .server(
                "Plex",
                ServerType::Plex,
                MockBackend::accepting().with_token_identity("alice_plex", "alice@example.com"),
            )
            .await;
        h.invitation(unlimited("OPEN42"), &[&jf, &plex]).await;
        h.invitation(unlimited("OTHER9"), &[&jf, &plex]).await;

        let phase_one = h
            .engine
            .submit(&fields(&[("code", "OPEN42"), ("token", "plex-token")]))
            .await
            .unwrap();
        let RedirectHint::ContinueWithForm { session } = phase_one.redirect_hint else {
            panic!("expected continue_with_form");
        };

        let mut wrong_code = form_fields("OTHER9", "alice", "");
        wrong_code.insert("session".to_string(), session.clone());
        let result = h.engine.submit(&wrong_code).await.unwrap();
        assert_eq!(result.message.as_deref(), Some(INVALID_SESSION));

        let mut replay = form_fields("OPEN42", "alice", "");
        replay.insert("session".to_string(), session);
        let result = h.engine.submit(&replay).await.unwrap();
        assert_eq!(result.message.as_deref(), Some(INVALID_SESSION));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_of_limited_code() {
        let h = Arc::new(Harness::new());
        let jf = h
            .server(
                "JF",
                ServerType::Jellyfin,
                MockBackend::with_behavior(crate::services::backend::MockBehavior::Delay(
                    Duration::from_millis(50),
                )),
            )
            .await;
        h.invitation(Invitation::new("ABC123"), &[&jf]).await;

        let tasks: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|name| {
                let h = h.clone();
                tokio::spawn(async move {
                    h.engine
                        .submit(&form_fields("ABC123", name, ""))
                        .await
                        .unwrap()
                        .status
                })
            })
            .collect();

        let mut statuses = Vec::new();
        for task in tasks {
            statuses.push(task.await.unwrap());
        }
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == RedemptionStatus::Success)
                .count(),
            1
        );
        assert_eq!(h.store.accounts().await.len(), 1);
        assert_eq!(h.store.usages().await.len(), 1);
    }
}
