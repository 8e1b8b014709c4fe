//! Resolution of the backend servers targeted by an invitation.

use thiserror::Error;

use super::backend::BackendRegistry;
use super::store::{InvitationStore, StoreError};
use crate::models::{AuthModality, Invitation, MediaServer, ServerSummary, ServerType, ServerUsage};

/// Configuration problems that make an invitation unredeemable as a whole.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No media server is configured for this invitation")]
    NoServers,

    #[error("Server '{server}' has unsupported type '{tag}'")]
    UnknownServerType { server: String, tag: String },

    #[error("No backend is available for server type {0}")]
    NoConnector(ServerType),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A server whose vendor tag has been checked against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedServer {
    pub server: MediaServer,
    pub server_type: ServerType,
}

impl ResolvedServer {
    pub fn modality(&self) -> AuthModality {
        self.server_type.auth_modality()
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            id: self.server.id,
            name: self.server.name.clone(),
            server_type: self.server_type,
        }
    }
}

/// Determine the ordered servers for an invitation.
///
/// The many-to-many association wins, then the legacy single-server
/// reference, then the first configured server. Delegated-token servers are
/// moved to the front, keeping relative order otherwise.
pub async fn resolve(
    store: &dyn InvitationStore,
    registry: &BackendRegistry,
    invitation: &Invitation,
) -> Result<Vec<ResolvedServer>, ResolveError> {
    let mut servers = store.associated_servers(invitation.id).await?;

    if servers.is_empty() {
        let legacy = match invitation.legacy_server_id {
            Some(server_id) => store.find_server(server_id).await?,
            None => None,
        };
        let fallback = match legacy {
            Some(server) => Some(server),
            None => store.first_server().await?,
        };
        servers.extend(fallback);
    }

    if servers.is_empty() {
        return Err(ResolveError::NoServers);
    }

    let mut resolved = servers
        .into_iter()
        .map(|server| check(registry, server))
        .collect::<Result<Vec<_>, _>>()?;

    resolved.sort_by_key(|s| s.modality() != AuthModality::DelegatedToken);
    Ok(resolved)
}

fn check(registry: &BackendRegistry, server: MediaServer) -> Result<ResolvedServer, ResolveError> {
    let server_type = server
        .kind()
        .map_err(|err| ResolveError::UnknownServerType {
            server: server.name.clone(),
            tag: err.0,
        })?;
    if !registry.supports(server_type) {
        return Err(ResolveError::NoConnector(server_type));
    }
    Ok(ResolvedServer {
        server,
        server_type,
    })
}

/// Servers still to be provisioned.
///
/// A limited invitation skips servers it has already been redeemed on, so a
/// retry after partial success only targets the remainder.
pub fn pending_servers(
    resolved: &[ResolvedServer],
    usages: &[ServerUsage],
    unlimited: bool,
) -> Vec<ResolvedServer> {
    resolved
        .iter()
        .filter(|s| unlimited || !usages.iter().any(|u| u.server_id == s.server.id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::MockConnector;
    use crate::services::memory_store::InMemoryStore;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    fn registry() -> BackendRegistry {
        let connector = Arc::new(MockConnector::new());
        BackendRegistry::new()
            .with(ServerType::Jellyfin, connector.clone())
            .with(ServerType::Emby, connector.clone())
            .with(ServerType::Plex, connector)
    }

    #[tokio::test]
    async fn test_association_orders_token_servers_first() {
        let store = InMemoryStore::new();
        let jf = store
            .add_server(MediaServer::new("JF", ServerType::Jellyfin, "http://jf"))
            .await;
        let emby = store
            .add_server(MediaServer::new("Emby", ServerType::Emby, "http://emby"))
            .await;
        let plex = store
            .add_server(MediaServer::new("Plex", ServerType::Plex, "http://plex"))
            .await;
        let invitation = store
            .add_invitation(Invitation::new("ABC123"), &[jf.id, emby.id, plex.id])
            .await;

        let resolved = resolve(&store, &registry(), &invitation).await.unwrap();
        let names: Vec<&str> = resolved.iter().map(|s| s.server.name.as_str()).collect();
        assert_eq!(names, vec!["Plex", "JF", "Emby"]);
    }

    #[tokio::test]
    async fn test_legacy_server_reference() {
        let store = InMemoryStore::new();
        store
            .add_server(MediaServer::new("First", ServerType::Jellyfin, "http://a"))
            .await;
        let legacy = store
            .add_server(MediaServer::new("Legacy", ServerType::Emby, "http://b"))
            .await;
        let mut invitation = Invitation::new("ABC123");
        invitation.legacy_server_id = Some(legacy.id);
        let invitation = store.add_invitation(invitation, &[]).await;

        let resolved = resolve(&store, &registry(), &invitation).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].server.name, "Legacy");
    }

    #[tokio::test]
    async fn test_falls_back_to_first_server() {
        let store = InMemoryStore::new();
        store
            .add_server(MediaServer::new("First", ServerType::Jellyfin, "http://a"))
            .await;
        let mut invitation = Invitation::new("ABC123");
        invitation.legacy_server_id = Some(Uuid::new_v4());
        let invitation = store.add_invitation(invitation, &[]).await;

        let resolved = resolve(&store, &registry(), &invitation).await.unwrap();
        assert_eq!(resolved[0].server.name, "First");
    }

    #[tokio::test]
    async fn test_no_servers() {
        let store = InMemoryStore::new();
        let invitation = store.add_invitation(Invitation::new("ABC123"), &[]).await;
        let err = resolve(&store, &registry(), &invitation).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoServers));
    }

    #[tokio::test]
    async fn test_unknown_server_type() {
        let store = InMemoryStore::new();
        let mut server = MediaServer::new("Odd", ServerType::Jellyfin, "http://odd");
        server.server_type = "betamax".to_string();
        let server = store.add_server(server).await;
        let invitation = store
            .add_invitation(Invitation::new("ABC123"), &[server.id])
            .await;

        let err = resolve(&store, &registry(), &invitation).await.unwrap_err();
        assert!(matches!(err, ResolveError::UnknownServerType { ref tag, .. } if tag == "betamax"));
    }

    #[tokio::test]
    async fn test_known_type_without_connector() {
        let store = InMemoryStore::new();
        let server = store
            .add_server(MediaServer::new("Komga", ServerType::Komga, "http://komga"))
            .await;
        let invitation = store
            .add_invitation(Invitation::new("ABC123"), &[server.id])
            .await;

        let err = resolve(&store, &registry(), &invitation).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoConnector(ServerType::Komga)));
    }

    #[test]
    fn test_pending_servers() {
        let a = ResolvedServer {
            server: MediaServer::new("A", ServerType::Jellyfin, "http://a"),
            server_type: ServerType::Jellyfin,
        };
        let b = ResolvedServer {
            server: MediaServer::new("B", ServerType::Emby, "http://b"),
            server_type: ServerType::Emby,
        };
        let usage = ServerUsage {
            invitation_id: Uuid::new_v4(),
            server_id: a.server.id,
            account_id: Some(Uuid::new_v4()),
            used_at: Utc::now(),
        };
        let servers = vec![a, b];

        let limited = pending_servers(&servers, std::slice::from_ref(&usage), false);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].server.name, "B");

        let unlimited = pending_servers(&servers, &[usage], true);
        assert_eq!(unlimited.len(), 2);
    }
}
