//! Plex client.
//!
//! Plex accounts are owned by plex.tv, so redemption shares the server with
//! the account behind the user's delegated token instead of creating a user.
//! Library external ids for Plex servers are the section keys reported by
//! the server.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use domain::models::MediaServer;
use domain::services::{
    BackendConnector, BackendError, ConnectionStatus, MediaBackend, ProvisionOutcome,
    ProvisionRequest, RemoteAccount, TokenProvisionRequest,
};

use super::{http_error, rejection_message};

pub const PLEX_TV_URL: &str = "https://plex.tv";

/// Identity sent with every request to Plex.
#[derive(Debug, Clone)]
pub struct PlexClientInfo {
    pub product: String,
    pub client_identifier: String,
}

pub struct PlexConnector {
    http: Client,
    plex_tv_url: String,
    info: PlexClientInfo,
    timeout_secs: u64,
}

impl PlexConnector {
    pub fn new(http: Client, info: PlexClientInfo, timeout_secs: u64) -> Self {
        Self {
            http,
            plex_tv_url: PLEX_TV_URL.to_string(),
            info,
            timeout_secs,
        }
    }

    pub fn with_plex_tv_url(mut self, url: &str) -> Self {
        self.plex_tv_url = url.trim_end_matches('/').to_string();
        self
    }
}

impl BackendConnector for PlexConnector {
    fn connect(&self, server: &MediaServer) -> Result<Arc<dyn MediaBackend>, BackendError> {
        let admin_token = server
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(BackendError::MissingCredential)?;
        Ok(Arc::new(PlexClient {
            http: self.http.clone(),
            server_url: server.url.trim_end_matches('/').to_string(),
            plex_tv_url: self.plex_tv_url.clone(),
            admin_token,
            info: self.info.clone(),
            timeout_secs: self.timeout_secs,
        }))
    }
}

pub struct PlexClient {
    http: Client,
    server_url: String,
    plex_tv_url: String,
    admin_token: String,
    info: PlexClientInfo,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct PlexUser {
    id: u64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityContainer {
    #[serde(rename = "MediaContainer")]
    media_container: Identity,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    machine_identifier: String,
}

#[derive(Debug, Deserialize)]
struct SectionsContainer {
    #[serde(rename = "MediaContainer")]
    media_container: Sections,
}

#[derive(Debug, Deserialize)]
struct Sections {
    #[serde(rename = "Directory", default)]
    directory: Vec<Section>,
}

#[derive(Debug, Deserialize)]
struct Section {
    key: String,
    title: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShareRequest<'a> {
    machine_identifier: &'a str,
    library_section_ids: Vec<u64>,
    invited_id: u64,
    settings: ShareSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShareSettings {
    allow_sync: bool,
    allow_channels: bool,
}

#[derive(Debug, Deserialize)]
struct SharedServer {
    id: u64,
}

impl PlexClient {
    fn request(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder
            .header("Accept", "application/json")
            .header("X-Plex-Product", &self.info.product)
            .header("X-Plex-Client-Identifier", &self.info.client_identifier)
            .header("X-Plex-Token", token)
    }

    fn map_err(&self, err: reqwest::Error) -> BackendError {
        http_error(err, self.timeout_secs)
    }

    async fn send(&self, builder: RequestBuilder, token: &str) -> Result<Response, BackendError> {
        self.request(builder, token)
            .send()
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn token_owner(&self, user_token: &str) -> Result<Option<PlexUser>, BackendError> {
        let url = format!("{}/api/v2/user", self.plex_tv_url);
        let response = self.send(self.http.get(url), user_token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let user = expect_json(response).await?;
        Ok(Some(user))
    }

    async fn machine_identifier(&self) -> Result<String, BackendError> {
        let url = format!("{}/identity", self.server_url);
        let response = self.send(self.http.get(url), &self.admin_token).await?;
        let identity: IdentityContainer = expect_json(response).await?;
        Ok(identity.media_container.machine_identifier)
    }

    async fn accept_share(&self, share_id: u64, user_token: &str) {
        let url = format!("{}/api/v2/shared_servers/{}/accept", self.plex_tv_url, share_id);
        match self.send(self.http.post(url), user_token).await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => tracing::warn!(
                share_id = share_id,
                status = %response.status(),
                "Plex share created but could not be accepted automatically"
            ),
            Err(err) => tracing::warn!(
                share_id = share_id,
                error = %err,
                "Plex share created but could not be accepted automatically"
            ),
        }
    }
}

#[async_trait::async_trait]
impl MediaBackend for PlexClient {
    async fn provision(&self, _request: &ProvisionRequest) -> Result<ProvisionOutcome, BackendError> {
        Err(BackendError::Unsupported("plex"))
    }

    #[instrument(skip(self, request), fields(server = %self.server_url))]
    async fn provision_with_token(
        &self,
        request: &TokenProvisionRequest,
    ) -> Result<ProvisionOutcome, BackendError> {
        let Some(user) = self.token_owner(&request.token).await? else {
            return Ok(ProvisionOutcome::rejected("Plex sign-in is no longer valid"));
        };

        let machine_identifier = self.machine_identifier().await?;
        let body = ShareRequest {
            machine_identifier: &machine_identifier,
            library_section_ids: section_ids(&request.libraries),
            invited_id: user.id,
            settings: ShareSettings {
                allow_sync: false,
                allow_channels: false,
            },
        };

        let url = format!("{}/api/v2/shared_servers", self.plex_tv_url);
        let response = self
            .send(self.http.post(url).json(&body), &self.admin_token)
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(ProvisionOutcome::rejected(
                "This Plex account already has access to the server",
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(ProvisionOutcome::rejected(rejection_message(status, &text)));
        }

        let share: SharedServer = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        self.accept_share(share.id, &request.token).await;

        tracing::debug!(plex_user_id = user.id, share_id = share.id, "Server shared");
        Ok(ProvisionOutcome::created(
            "Server shared with your Plex account",
            RemoteAccount {
                remote_id: Some(user.id.to_string()),
                username: user.username,
                email: user.email,
            },
        ))
    }

    async fn list_libraries(&self) -> Result<BTreeMap<String, String>, BackendError> {
        let url = format!("{}/library/sections", self.server_url);
        let response = self.send(self.http.get(url), &self.admin_token).await?;
        let sections: SectionsContainer = expect_json(response).await?;
        Ok(sections
            .media_container
            .directory
            .into_iter()
            .map(|s| (s.key, s.title))
            .collect())
    }

    async fn validate_connection(&self) -> ConnectionStatus {
        match self.machine_identifier().await {
            Ok(machine_identifier) => ConnectionStatus {
                ok: true,
                message: format!("Connected to Plex server {}", machine_identifier),
            },
            Err(err) => ConnectionStatus {
                ok: false,
                message: err.to_string(),
            },
        }
    }
}

async fn expect_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(BackendError::InvalidResponse(rejection_message(status, &text)));
    }
    response
        .json()
        .await
        .map_err(|e| BackendError::InvalidResponse(e.to_string()))
}

/// Plex section keys are numeric; anything else cannot be shared.
fn section_ids(libraries: &[String]) -> Vec<u64> {
    libraries
        .iter()
        .filter_map(|id| match id.trim().parse() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(library = %id, "Ignoring non-numeric Plex library id");
                None
            }
        })
        .collect()
}
