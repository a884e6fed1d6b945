//! Error types for rendercache
//!
//! Drift and corruption are normally healed locally and surfaced as issues;
//! they only appear as errors on the paths that detect them. Configuration
//! errors are fatal and prevent the cache from opening.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for rendercache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for rendercache
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("index drift at {path}: {reason}")]
    IndexDrift { path: String, reason: String },

    #[error("write failed for {key} after {attempts} attempts: {reason}")]
    WriteFailure {
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("shard {shard} corrupt: {reason}")]
    ShardCorruption { shard: u32, reason: String },

    #[error("invalid relative path: {0:?}")]
    InvalidPath(String),

    #[error("blob corrupt: {0}")]
    BlobCorrupt(String),

    // Configuration errors
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(
        "legacy cache layout detected at {path}; this version uses a sharded layout, \
         delete the directory contents to migrate"
    )]
    LegacyLayout { path: PathBuf },

    #[error(
        "cache at {path} was created with {on_disk} shards but {configured} are configured; \
         changing the shard count requires wiping the cache directory"
    )]
    ShardCountMismatch {
        path: PathBuf,
        on_disk: u32,
        configured: u32,
    },

    // Build errors
    #[error("build failed for {key}: {reason}")]
    BuildFailed { key: String, reason: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    #[error("cache is shutting down")]
    ShuttingDown,

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if retrying the same operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DiskIo(_) | Self::Storage(_) | Self::WriteFailure { .. })
    }

    /// Check if this error must prevent the cache from starting
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationConflict(_)
                | Self::Configuration(_)
                | Self::LegacyLayout { .. }
                | Self::ShardCountMismatch { .. }
        )
    }

    /// Check if the underlying cause is a missing file
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::DiskIo(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
