//! Media server and library domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Supported backend vendors.
///
/// The set is closed: a stored tag that does not parse into one of these
/// variants is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Jellyfin,
    Emby,
    Plex,
    Audiobookshelf,
    Komga,
    Kavita,
    Navidrome,
    Romm,
}

impl ServerType {
    pub const ALL: [ServerType; 8] = [
        ServerType::Jellyfin,
        ServerType::Emby,
        ServerType::Plex,
        ServerType::Audiobookshelf,
        ServerType::Komga,
        ServerType::Kavita,
        ServerType::Navidrome,
        ServerType::Romm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Jellyfin => "jellyfin",
            ServerType::Emby => "emby",
            ServerType::Plex => "plex",
            ServerType::Audiobookshelf => "audiobookshelf",
            ServerType::Komga => "komga",
            ServerType::Kavita => "kavita",
            ServerType::Navidrome => "navidrome",
            ServerType::Romm => "romm",
        }
    }

    /// How users authenticate when an account is created on this vendor.
    pub fn auth_modality(&self) -> AuthModality {
        match self {
            ServerType::Plex => AuthModality::DelegatedToken,
            _ => AuthModality::CredentialForm,
        }
    }
}

impl FromStr for ServerType {
    type Err = UnknownServerType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServerType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownServerType(s.to_string()))
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A server type tag that is not part of the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown server type: {0}")]
pub struct UnknownServerType(pub String);

/// Authentication modality of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthModality {
    /// Username and password submitted through a form.
    CredentialForm,
    /// A third-party issued token authorizes account creation.
    DelegatedToken,
}

/// A configured external account-hosting backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MediaServer {
    pub id: Uuid,
    pub name: String,
    /// Raw vendor tag as stored; see [`MediaServer::kind`].
    pub server_type: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl MediaServer {
    pub fn new(name: &str, server_type: ServerType, url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            server_type: server_type.as_str().to_string(),
            url: url.to_string(),
            api_key: None,
            verified: true,
            created_at: Utc::now(),
        }
    }

    /// Parse the stored vendor tag.
    pub fn kind(&self) -> Result<ServerType, UnknownServerType> {
        self.server_type.parse()
    }
}

/// A library on a media server that invitations may restrict access to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Library {
    pub id: Uuid,
    pub server_id: Uuid,
    /// Identifier used by the backend itself.
    pub external_id: String,
    pub name: String,
}

/// Public server info shown before redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerSummary {
    pub id: Uuid,
    pub name: String,
    pub server_type: ServerType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_type_round_trip_all() {
        for server_type in ServerType::ALL {
            assert_eq!(server_type.as_str().parse::<ServerType>(), Ok(server_type));
        }
    }

    #[test]
    fn test_server_type_parse_is_case_insensitive() {
        assert_eq!("Jellyfin".parse::<ServerType>(), Ok(ServerType::Jellyfin));
        assert_eq!(" PLEX ".parse::<ServerType>(), Ok(ServerType::Plex));
    }

    #[test]
    fn test_server_type_unknown() {
        let err = "betamax".parse::<ServerType>().unwrap_err();
        assert_eq!(err, UnknownServerType("betamax".to_string()));
        assert_eq!(err.to_string(), "unknown server type: betamax");
    }

    #[test]
    fn test_auth_modality() {
        assert_eq!(ServerType::Plex.auth_modality(), AuthModality::DelegatedToken);
        assert_eq!(ServerType::Jellyfin.auth_modality(), AuthModality::CredentialForm);
        assert_eq!(ServerType::Emby.auth_modality(), AuthModality::CredentialForm);
    }

    #[test]
    fn test_media_server_kind() {
        let mut server = MediaServer::new("Main", ServerType::Emby, "http://emby:8096");
        assert_eq!(server.kind(), Ok(ServerType::Emby));

        server.server_type = "unknown".to_string();
        assert!(server.kind().is_err());
    }

    #[test]
    fn test_media_server_serialization_hides_api_key() {
        let mut server = MediaServer::new("Main", ServerType::Jellyfin, "http://jf:8096");
        server.api_key = Some("secret-key".to_string());
        let json = serde_json::to_string(&server).unwrap();
        assert!(!json.contains("secret-key"));
        assert!(json.contains("jellyfin"));
    }
}
