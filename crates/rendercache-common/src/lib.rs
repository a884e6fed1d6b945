//! rendercache common - shared types and utilities
//!
//! This crate provides the cache key and entry types, the options surface,
//! and the error taxonomy used by the storage engine and the operator CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheOptions, MB};
pub use error::{Error, Result};
pub use types::*;
