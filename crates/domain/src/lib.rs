//! Domain layer for the invitation service.
//!
//! This crate contains:
//! - Domain models (Invitation, MediaServer, Account, Identity)
//! - The backend capability contract and registry
//! - The store contract and an in-memory implementation
//! - The redemption engine and its components

pub mod models;
pub mod services;
