//! Core type definitions for rendercache
//!
//! Cache keys, the per-file metadata kept in the folder index, the blobs
//! handed back to callers, and the issue records surfaced for observability.

use bytes::Bytes;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Index of a shard within a cache directory
pub type ShardId = u32;

/// Opaque fingerprint identifying a request's deterministic output
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key from any string-like fingerprint
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the key bytes (input to shard routing and path hashing)
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Current wall-clock time in unix milliseconds
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert a filesystem timestamp to unix milliseconds
#[must_use]
pub fn system_time_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Produced output: the encoded bytes and their content type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedBlob {
    pub bytes: Bytes,
    pub content_type: String,
}

impl CachedBlob {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Metadata for one cached file
///
/// Owned by the folder index node that contains it; callers only ever see
/// copies. `accessed_ms` is bumped in memory on every hit and is not written
/// back to the shard log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Logical key, when known (entries discovered by a disk scan have none)
    pub key: Option<CacheKey>,
    /// Location under the shard's blob root, `/`-separated
    pub relative_path: String,
    /// Size of the file on disk
    pub size_bytes: u64,
    /// Creation timestamp (unix millis)
    pub created_ms: u64,
    /// Last modification timestamp (unix millis)
    pub modified_ms: u64,
    /// Last access timestamp (unix millis)
    pub accessed_ms: u64,
}

impl CacheEntry {
    /// Milliseconds since the entry was last accessed
    #[must_use]
    pub fn idle_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.accessed_ms)
    }
}

/// Severity of a reported issue
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A non-fatal problem surfaced through `DiskCache::issues`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    /// Component that raised the issue (e.g. `shard-0003`, `options`)
    pub source: String,
    pub message: String,
    pub severity: Severity,
}

impl Issue {
    pub fn new(source: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, message, Severity::Info)
    }

    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, message, Severity::Warning)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, message, Severity::Error)
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.source, self.message)
    }
}
