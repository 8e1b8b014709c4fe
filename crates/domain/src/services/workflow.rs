//! Workflow selection over the authentication modalities of resolved servers.

use super::resolver::ResolvedServer;
use crate::models::{AuthModality, TemplateHint};

/// How credentials are collected for a redemption.
#[derive(Debug, Clone)]
pub enum Workflow {
    /// Every server takes a username and password.
    FormBased { servers: Vec<ResolvedServer> },
    /// Every server is provisioned from a delegated token.
    DelegatedToken { servers: Vec<ResolvedServer> },
    /// Token servers run first; the credential form is only collected after
    /// the token step completed.
    Hybrid {
        token_servers: Vec<ResolvedServer>,
        form_servers: Vec<ResolvedServer>,
    },
}

impl Workflow {
    /// Pick the workflow for an ordered server list. An empty list selects
    /// the form-based workflow.
    pub fn select(servers: Vec<ResolvedServer>) -> Self {
        let (token_servers, form_servers): (Vec<_>, Vec<_>) = servers
            .into_iter()
            .partition(|s| s.modality() == AuthModality::DelegatedToken);

        match (token_servers.is_empty(), form_servers.is_empty()) {
            (true, _) => Workflow::FormBased {
                servers: form_servers,
            },
            (false, true) => Workflow::DelegatedToken {
                servers: token_servers,
            },
            (false, false) => Workflow::Hybrid {
                token_servers,
                form_servers,
            },
        }
    }

    /// Servers that take the credential form, in order. Used by the second
    /// phase of a hybrid redemption, where token servers already redeemed on
    /// a limited code are no longer pending.
    pub fn into_form_servers(self) -> Vec<ResolvedServer> {
        match self {
            Workflow::FormBased { servers } => servers,
            Workflow::DelegatedToken { .. } => Vec::new(),
            Workflow::Hybrid { form_servers, .. } => form_servers,
        }
    }

    pub fn template_hint(&self) -> TemplateHint {
        match self {
            Workflow::FormBased { .. } => TemplateHint::CredentialForm,
            Workflow::DelegatedToken { .. } => TemplateHint::DelegatedLogin,
            Workflow::Hybrid { .. } => TemplateHint::DelegatedThenForm,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Workflow::FormBased { .. } => "form_based",
            Workflow::DelegatedToken { .. } => "delegated_token",
            Workflow::Hybrid { .. } => "hybrid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaServer, ServerType};

    fn server(server_type: ServerType) -> ResolvedServer {
        ResolvedServer {
            server: MediaServer::new(server_type.as_str(), server_type, "http://server"),
            server_type,
        }
    }

    #[test]
    fn test_form_only() {
        let workflow = Workflow::select(vec![server(ServerType::Jellyfin), server(ServerType::Emby)]);
        assert!(matches!(workflow, Workflow::FormBased { ref servers } if servers.len() == 2));
        assert_eq!(workflow.template_hint(), TemplateHint::CredentialForm);
    }

    #[test]
    fn test_token_only() {
        let workflow = Workflow::select(vec![server(ServerType::Plex)]);
        assert!(matches!(workflow, Workflow::DelegatedToken { .. }));
        assert_eq!(workflow.template_hint(), TemplateHint::DelegatedLogin);
    }

    #[test]
    fn test_mixed_is_hybrid() {
        let workflow = Workflow::select(vec![
            server(ServerType::Plex),
            server(ServerType::Jellyfin),
            server(ServerType::Navidrome),
        ]);
        match workflow {
            Workflow::Hybrid {
                token_servers,
                form_servers,
            } => {
                assert_eq!(token_servers.len(), 1);
                assert_eq!(form_servers.len(), 2);
            }
            other => panic!("expected hybrid, got {}", other.name()),
        }
    }

    #[test]
    fn test_form_servers_of_each_workflow() {
        let hybrid = Workflow::select(vec![server(ServerType::Jellyfin), server(ServerType::Plex)]);
        let form = hybrid.into_form_servers();
        assert_eq!(form.len(), 1);
        assert_eq!(form[0].server_type, ServerType::Jellyfin);

        let token_only = Workflow::select(vec![server(ServerType::Plex)]);
        assert!(token_only.into_form_servers().is_empty());

        let form_only = Workflow::select(vec![server(ServerType::Komga), server(ServerType::Kavita)]);
        assert_eq!(form_only.into_form_servers().len(), 2);
    }

    #[test]
    fn test_empty_defaults_to_form() {
        let workflow = Workflow::select(Vec::new());
        assert!(matches!(workflow, Workflow::FormBased { ref servers } if servers.is_empty()));
    }
}
