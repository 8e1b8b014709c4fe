//! Invitation redemption services.
//!
//! The engine components are plain functions or small structs over the
//! [`store::InvitationStore`] and [`backend::MediaBackend`] contracts, wired
//! together by [`engine::RedemptionEngine`].

pub mod aggregator;
pub mod backend;
pub mod engine;
pub mod identity_linker;
pub mod memory_store;
pub mod provisioner;
pub mod resolver;
pub mod store;
pub mod usage_tracker;
pub mod validator;
pub mod workflow;

pub use aggregator::{aggregate, redirect_for, summarize};
pub use backend::{
    BackendConnector, BackendError, BackendRegistry, ConnectionStatus, MediaBackend, MockBackend,
    MockBehavior, MockConnector, ProvisionOutcome, ProvisionRequest, RemoteAccount,
    TokenProvisionRequest,
};
pub use engine::{EngineConfig, EngineError, RedemptionEngine};
pub use identity_linker::{link_or_create, LinkDecision, Linked};
pub use memory_store::InMemoryStore;
pub use provisioner::{AuthMaterial, Provisioner};
pub use resolver::{pending_servers, resolve, ResolveError, ResolvedServer};
pub use store::{CodeLease, InvitationStore, RedemptionTx, StoreError, UsageState};
pub use usage_tracker::mark_used;
pub use validator::{validate_shape, validate_state};
pub use workflow::Workflow;
