//! Jellyfin and Emby client.
//!
//! Both servers speak the same user management API. Emby ignores the
//! password in `Users/New`, so it is set with a second call.

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use domain::models::MediaServer;
use domain::services::{
    BackendConnector, BackendError, ConnectionStatus, MediaBackend, ProvisionOutcome,
    ProvisionRequest, RemoteAccount,
};

use super::{http_error, rejection_message};

const TOKEN_HEADER: &str = "X-Emby-Token";

/// Which member of the API family a server is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Jellyfin,
    Emby,
}

impl Flavor {
    fn label(&self) -> &'static str {
        match self {
            Flavor::Jellyfin => "jellyfin",
            Flavor::Emby => "emby",
        }
    }
}

pub struct JellyfinConnector {
    http: Client,
    flavor: Flavor,
    timeout_secs: u64,
}

impl JellyfinConnector {
    pub fn new(http: Client, flavor: Flavor, timeout_secs: u64) -> Self {
        Self {
            http,
            flavor,
            timeout_secs,
        }
    }
}

impl BackendConnector for JellyfinConnector {
    fn connect(&self, server: &MediaServer) -> Result<Arc<dyn MediaBackend>, BackendError> {
        let api_key = server
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(BackendError::MissingCredential)?;
        Ok(Arc::new(JellyfinClient {
            http: self.http.clone(),
            base_url: server.url.trim_end_matches('/').to_string(),
            api_key,
            flavor: self.flavor,
            timeout_secs: self.timeout_secs,
        }))
    }
}

pub struct JellyfinClient {
    http: Client,
    base_url: String,
    api_key: String,
    flavor: Flavor,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct NewUserRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SetPasswordRequest<'a> {
    #[serde(rename = "NewPw")]
    new_pw: &'a str,
    #[serde(rename = "ResetPassword")]
    reset_password: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserDto {
    id: String,
    name: String,
    #[serde(default)]
    policy: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MediaFolders {
    #[serde(default)]
    items: Vec<MediaFolder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MediaFolder {
    id: String,
    name: String,
}

impl JellyfinClient {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn map_err(&self, err: reqwest::Error) -> BackendError {
        http_error(err, self.timeout_secs)
    }

    async fn get_user(&self, user_id: &str) -> Result<UserDto, BackendError> {
        let response = self
            .http
            .get(self.url(&format!("Users/{}", user_id)))
            .header(TOKEN_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        let response = expect_success(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    async fn set_password(&self, user_id: &str, password: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.url(&format!("Users/{}/Password", user_id)))
            .header(TOKEN_HEADER, &self.api_key)
            .json(&SetPasswordRequest {
                new_pw: password,
                reset_password: false,
            })
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        expect_success(response).await.map(|_| ())
    }

    async fn apply_policy(&self, user_id: &str, libraries: &[String]) -> Result<(), BackendError> {
        let user = self.get_user(user_id).await?;
        let mut policy = user.policy.unwrap_or_else(|| Value::Object(Default::default()));
        restrict_libraries(&mut policy, libraries);

        let response = self
            .http
            .post(self.url(&format!("Users/{}/Policy", user_id)))
            .header(TOKEN_HEADER, &self.api_key)
            .json(&policy)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        expect_success(response).await.map(|_| ())
    }

    /// Best effort removal of a half-configured user.
    async fn delete_user(&self, user_id: &str) {
        let result = self
            .http
            .delete(self.url(&format!("Users/{}", user_id)))
            .header(TOKEN_HEADER, &self.api_key)
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!(user_id = %user_id, error = %err, "Failed to remove partially created user");
        }
    }

    async fn finish_setup(&self, user_id: &str, request: &ProvisionRequest) -> Result<(), BackendError> {
        if self.flavor == Flavor::Emby {
            self.set_password(user_id, &request.password).await?;
        }
        self.apply_policy(user_id, &request.libraries).await
    }
}

#[async_trait::async_trait]
impl MediaBackend for JellyfinClient {
    #[instrument(skip(self, request), fields(server = %self.base_url, username = %request.username))]
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome, BackendError> {
        let body = NewUserRequest {
            name: &request.username,
            password: match self.flavor {
                Flavor::Jellyfin => Some(&request.password),
                Flavor::Emby => None,
            },
        };
        let response = self
            .http
            .post(self.url("Users/New"))
            .header(TOKEN_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Ok(ProvisionOutcome::rejected(rejection_message(status, &text)));
        }

        let user: UserDto = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        if let Err(err) = self.finish_setup(&user.id, request).await {
            self.delete_user(&user.id).await;
            return Err(err);
        }

        tracing::debug!(user_id = %user.id, flavor = self.flavor.label(), "User created");
        Ok(ProvisionOutcome::created(
            "Account created",
            RemoteAccount {
                remote_id: Some(user.id),
                username: Some(user.name),
                email: request.email.clone(),
            },
        ))
    }

    async fn list_libraries(&self) -> Result<BTreeMap<String, String>, BackendError> {
        let response = self
            .http
            .get(self.url("Library/MediaFolders"))
            .header(TOKEN_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        let folders: MediaFolders = expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        Ok(folders.items.into_iter().map(|f| (f.id, f.name)).collect())
    }

    async fn validate_connection(&self) -> ConnectionStatus {
        let result = self
            .http
            .get(self.url("System/Info"))
            .header(TOKEN_HEADER, &self.api_key)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => ConnectionStatus {
                ok: true,
                message: format!("Connected to {}", self.flavor.label()),
            },
            Ok(response) => ConnectionStatus {
                ok: false,
                message: format!("Server answered {}", response.status()),
            },
            Err(err) => ConnectionStatus {
                ok: false,
                message: self.map_err(err).to_string(),
            },
        }
    }
}

async fn expect_success(response: Response) -> Result<Response, BackendError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(BackendError::InvalidResponse(rejection_message(status, &text)))
}

/// Limit a user policy to the given folder ids. An empty list grants all.
fn restrict_libraries(policy: &mut Value, libraries: &[String]) {
    if !policy.is_object() {
        *policy = Value::Object(Default::default());
    }
    if let Some(map) = policy.as_object_mut() {
        map.insert("EnableAllFolders".to_string(), Value::Bool(libraries.is_empty()));
        map.insert(
            "EnabledFolders".to_string(),
            Value::Array(libraries.iter().cloned().map(Value::String).collect()),
        );
    }
}
