//! Capability contract for media server backends.
//!
//! Every vendor integration implements [`MediaBackend`]. The
//! [`BackendRegistry`] maps each [`ServerType`] to the connector that builds
//! a backend client for a concrete server.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{MediaServer, ServerType};

/// Errors raised by a backend capability call.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("operation not supported by {0}")]
    Unsupported(&'static str),

    #[error("server credential is missing")]
    MissingCredential,

    #[error("request to backend failed: {0}")]
    Http(String),

    #[error("backend returned an unexpected response: {0}")]
    InvalidResponse(String),

    #[error("backend did not answer within {0} seconds")]
    Timeout(u64),
}

/// Request to create an account from submitted credentials.
#[derive(Clone)]
pub struct ProvisionRequest {
    pub username: String,
    pub password: String,
    pub confirm: String,
    pub email: Option<String>,
    pub invitation_code: String,
    /// External library ids the account is limited to. Empty means all.
    pub libraries: Vec<String>,
    pub expires: Option<DateTime<Utc>>,
}

impl fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("invitation_code", &self.invitation_code)
            .field("libraries", &self.libraries)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

/// Request to grant access using a delegated token.
#[derive(Clone)]
pub struct TokenProvisionRequest {
    pub token: String,
    pub invitation_code: String,
    pub libraries: Vec<String>,
    pub expires: Option<DateTime<Utc>>,
}

impl fmt::Debug for TokenProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvisionRequest")
            .field("invitation_code", &self.invitation_code)
            .field("libraries", &self.libraries)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

/// Account as reported by the backend after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAccount {
    pub remote_id: Option<String>,
    pub username: Option<String>,
    /// For delegated-token backends this is the email verified by the
    /// token issuer.
    pub email: Option<String>,
}

/// Result of a provisioning call that reached the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub ok: bool,
    pub message: String,
    pub account: Option<RemoteAccount>,
}

impl ProvisionOutcome {
    pub fn created(message: impl Into<String>, account: RemoteAccount) -> Self {
        Self {
            ok: true,
            message: message.into(),
            account: Some(account),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            account: None,
        }
    }
}

/// Result of a connection check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub ok: bool,
    pub message: String,
}

/// Capabilities every backend integration provides.
#[async_trait::async_trait]
pub trait MediaBackend: Send + Sync {
    /// Create an account from form credentials.
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome, BackendError>;

    /// Grant access using a delegated token.
    ///
    /// Only backends with delegated-token authentication implement this.
    async fn provision_with_token(
        &self,
        _request: &TokenProvisionRequest,
    ) -> Result<ProvisionOutcome, BackendError> {
        Err(BackendError::Unsupported("credential-form backends"))
    }

    /// Libraries available on the server, keyed by external id.
    async fn list_libraries(&self) -> Result<BTreeMap<String, String>, BackendError>;

    /// Check that the server is reachable with the stored credential.
    async fn validate_connection(&self) -> ConnectionStatus;
}

/// Builds a backend client for a configured server.
pub trait BackendConnector: Send + Sync {
    fn connect(&self, server: &MediaServer) -> Result<Arc<dyn MediaBackend>, BackendError>;
}

/// Table of connectors keyed by server type.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    connectors: HashMap<ServerType, Arc<dyn BackendConnector>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector for a server type, replacing any previous one.
    pub fn with(mut self, server_type: ServerType, connector: Arc<dyn BackendConnector>) -> Self {
        self.connectors.insert(server_type, connector);
        self
    }

    pub fn supports(&self, server_type: ServerType) -> bool {
        self.connectors.contains_key(&server_type)
    }

    /// Server types without a registered connector.
    pub fn missing(&self) -> Vec<ServerType> {
        ServerType::ALL
            .into_iter()
            .filter(|t| !self.supports(*t))
            .collect()
    }

    pub fn connect(
        &self,
        server_type: ServerType,
        server: &MediaServer,
    ) -> Result<Arc<dyn MediaBackend>, BackendError> {
        self.connectors
            .get(&server_type)
            .ok_or(BackendError::Unsupported(server_type.as_str()))?
            .connect(server)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.connectors.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("BackendRegistry")
            .field("server_types", &types)
            .finish()
    }
}

/// Scripted behaviour of a [`MockBackend`].
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Accept every request.
    Accept,
    /// Answer with `ok = false` and the given message.
    Reject(String),
    /// Raise a [`BackendError::Http`] with the given message.
    Fail(String),
    /// Sleep before accepting.
    Delay(Duration),
}

/// Mock backend for development and testing.
///
/// Records every provisioning call but never talks to a real server.
#[derive(Debug)]
pub struct MockBackend {
    behavior: MockBehavior,
    token_identity: Option<(String, String)>,
    libraries: BTreeMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn accepting() -> Self {
        Self::with_behavior(MockBehavior::Accept)
    }

    pub fn rejecting(message: &str) -> Self {
        Self::with_behavior(MockBehavior::Reject(message.to_string()))
    }

    pub fn failing(message: &str) -> Self {
        Self::with_behavior(MockBehavior::Fail(message.to_string()))
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            token_identity: None,
            libraries: BTreeMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Username and verified email reported for delegated-token requests.
    pub fn with_token_identity(mut self, username: &str, email: &str) -> Self {
        self.token_identity = Some((username.to_string(), email.to_string()));
        self
    }

    pub fn with_libraries(mut self, libraries: &[(&str, &str)]) -> Self {
        self.libraries = libraries
            .iter()
            .map(|(id, name)| (id.to_string(), name.to_string()))
            .collect();
        self
    }

    /// Usernames (or `token:<code>`) of every provisioning call so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, entry: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(entry);
        }
    }

    async fn respond(&self, account: RemoteAccount) -> Result<ProvisionOutcome, BackendError> {
        match &self.behavior {
            MockBehavior::Accept => Ok(ProvisionOutcome::created("Account created", account)),
            MockBehavior::Reject(message) => Ok(ProvisionOutcome::rejected(message.clone())),
            MockBehavior::Fail(message) => Err(BackendError::Http(message.clone())),
            MockBehavior::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(ProvisionOutcome::created("Account created", account))
            }
        }
    }
}

#[async_trait::async_trait]
impl MediaBackend for MockBackend {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome, BackendError> {
        self.record(request.username.clone());
        tracing::debug!(username = %request.username, "Mock: provisioning account");
        self.respond(RemoteAccount {
            remote_id: Some(Uuid::new_v4().to_string()),
            username: Some(request.username.clone()),
            email: request.email.clone(),
        })
        .await
    }

    async fn provision_with_token(
        &self,
        request: &TokenProvisionRequest,
    ) -> Result<ProvisionOutcome, BackendError> {
        self.record(format!("token:{}", request.invitation_code));
        let (username, email) = match &self.token_identity {
            Some((username, email)) => (Some(username.clone()), Some(email.clone())),
            None => (None, None),
        };
        self.respond(RemoteAccount {
            remote_id: Some(Uuid::new_v4().to_string()),
            username,
            email,
        })
        .await
    }

    async fn list_libraries(&self) -> Result<BTreeMap<String, String>, BackendError> {
        match &self.behavior {
            MockBehavior::Fail(message) => Err(BackendError::Http(message.clone())),
            _ => Ok(self.libraries.clone()),
        }
    }

    async fn validate_connection(&self) -> ConnectionStatus {
        match &self.behavior {
            MockBehavior::Fail(message) => ConnectionStatus {
                ok: false,
                message: message.clone(),
            },
            _ => ConnectionStatus {
                ok: true,
                message: "Mock server reachable".to_string(),
            },
        }
    }
}

/// Connector that hands out pre-built mock backends per server id.
#[derive(Default)]
pub struct MockConnector {
    backends: Mutex<HashMap<Uuid, Arc<MockBackend>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server_id: Uuid, backend: MockBackend) -> Arc<MockBackend> {
        let backend = Arc::new(backend);
        if let Ok(mut backends) = self.backends.lock() {
            backends.insert(server_id, backend.clone());
        }
        backend
    }
}

impl BackendConnector for MockConnector {
    fn connect(&self, server: &MediaServer) -> Result<Arc<dyn MediaBackend>, BackendError> {
        let backends = self
            .backends
            .lock()
            .map_err(|_| BackendError::Http("mock connector poisoned".to_string()))?;
        match backends.get(&server.id) {
            Some(backend) => Ok(backend.clone() as Arc<dyn MediaBackend>),
            None => Err(BackendError::Http(format!(
                "no mock backend for server {}",
                server.name
            ))),
        }
    }
}
