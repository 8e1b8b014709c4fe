//! Outbound integrations.

pub mod backends;
