//! Boxbus Common - shared types for the boxbus coordination layer
//!
//! This crate provides:
//! - The `ClusterError` fault taxonomy shared by every component
//! - Canonical JSON helpers used for compare-and-swap and config diffing
//! - Name validation for config sections, keys, and lock names

pub mod error;
pub mod utils;

pub use error::{ClusterError, Result};
pub use utils::{canonical_json, validate_name};
