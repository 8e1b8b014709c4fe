//! Repository implementations for database operations.

pub mod delegated_session;
pub mod invitation;
pub mod media_server;

pub use delegated_session::DelegatedSessionRepository;
pub use invitation::InvitationRepository;
pub use media_server::MediaServerRepository;
