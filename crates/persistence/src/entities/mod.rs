//! Database entity definitions.
//!
//! Entities are direct mappings to database rows.

pub mod account;
pub mod delegated_session;
pub mod invitation;
pub mod media_server;

pub use account::{AccountEntity, IdentityEntity, ServerUsageEntity};
pub use delegated_session::DelegatedSessionEntity;
pub use invitation::InvitationEntity;
pub use media_server::{LibraryEntity, MediaServerEntity};
