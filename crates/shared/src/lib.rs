//! Shared utilities and common types for the invitation engine.
//!
//! This crate provides common functionality used across all other crates:
//! - Random code generation and hashing
//! - Common validation logic

pub mod crypto;
pub mod validation;
