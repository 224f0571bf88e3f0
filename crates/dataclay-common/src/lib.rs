//! dataClay Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and configuration
//! used across all dataClay-rs components.

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{BackendConfig, ClientConfig, MetadataConfig};
pub use error::{Error, Result};
pub use types::*;
pub use value::{ObjectFields, Value};
