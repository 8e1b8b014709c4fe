//! HTTP clients for the supported media server vendors.

mod jellyfin;
mod plex;

pub use jellyfin::{Flavor, JellyfinClient, JellyfinConnector};
pub use plex::{PlexClient, PlexClientInfo, PlexConnector, PLEX_TV_URL};

use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use domain::models::ServerType;
use domain::services::{BackendError, BackendRegistry};

use crate::config::BackendsConfig;

/// Longest backend error body echoed back to the user.
const MAX_MESSAGE_LEN: usize = 200;

/// Build the registry of vendor connectors sharing one HTTP client.
pub fn build_registry(config: &BackendsConfig) -> Result<BackendRegistry, BackendError> {
    let timeout_secs = config.http_timeout_secs.max(1);
    let http = Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("invitation-server/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| BackendError::Http(e.to_string()))?;

    let plex_info = PlexClientInfo {
        product: config.client_product.clone(),
        client_identifier: config.client_identifier.clone(),
    };

    Ok(BackendRegistry::new()
        .with(
            ServerType::Jellyfin,
            Arc::new(JellyfinConnector::new(http.clone(), Flavor::Jellyfin, timeout_secs)),
        )
        .with(
            ServerType::Emby,
            Arc::new(JellyfinConnector::new(http.clone(), Flavor::Emby, timeout_secs)),
        )
        .with(
            ServerType::Plex,
            Arc::new(PlexConnector::new(http, plex_info, timeout_secs)),
        ))
}

pub(crate) fn http_error(err: reqwest::Error, timeout_secs: u64) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout_secs)
    } else {
        BackendError::Http(err.to_string())
    }
}

/// Turn a non-success answer into a short message fit for the user.
pub(crate) fn rejection_message(status: StatusCode, body: &str) -> String {
    let body = body.trim().trim_matches('"');
    if body.is_empty() || body.starts_with('<') {
        return format!("Server rejected the request ({})", status);
    }
    let mut message: String = body.chars().take(MAX_MESSAGE_LEN).collect();
    if body.chars().count() > MAX_MESSAGE_LEN {
        message.push_str("...");
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_message() {
        assert_eq!(
            rejection_message(StatusCode::BAD_REQUEST, "\"A user with the name 'alice' already exists.\""),
            "A user with the name 'alice' already exists."
        );
        assert_eq!(
            rejection_message(StatusCode::FORBIDDEN, ""),
            "Server rejected the request (403 Forbidden)"
        );
        assert_eq!(
            rejection_message(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>"),
            "Server rejected the request (502 Bad Gateway)"
        );
    }

    #[test]
    fn test_rejection_message_truncates() {
        let long = "x".repeat(MAX_MESSAGE_LEN + 50);
        let message = rejection_message(StatusCode::BAD_REQUEST, &long);
        assert_eq!(message.len(), MAX_MESSAGE_LEN + 3);
    }

    #[test]
    fn test_build_registry() {
        let registry = build_registry(&BackendsConfig::default()).unwrap();
        assert!(registry.supports(ServerType::Jellyfin));
        assert!(registry.supports(ServerType::Emby));
        assert!(registry.supports(ServerType::Plex));
        assert!(registry.missing().contains(&ServerType::Komga));
    }
}
