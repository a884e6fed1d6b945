//! Configuration types for rendercache
//!
//! `CacheOptions` is the whole recognised option surface. Sizes are given in
//! megabytes and durations in milliseconds/seconds so the struct maps one to
//! one onto a TOML `[cache]` table.

use crate::error::{Error, Result};
use crate::types::Issue;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// One megabyte, the unit of every size option
pub const MB: u64 = 1024 * 1024;

/// Upper bound on `database_shards`
pub const MAX_SHARDS: u32 = 4096;

/// Caches smaller than this are reported as undersized
pub const MIN_RECOMMENDED_CACHE_MB: u64 = 50;

/// Disk cache options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Absolute path of the cache directory
    pub cache_location: PathBuf,
    /// Served web root; the cache directory must not resolve inside it
    pub web_root: Option<PathBuf>,
    /// Total on-disk budget
    pub cache_size_mb: u64,
    /// Memory budget for writes not yet flushed to disk
    pub write_queue_memory_mb: u64,
    /// Minimum amount freed by one eviction sweep
    pub eviction_sweep_size_mb: u64,
    /// Entries accessed more recently than this are never evicted
    pub min_age_to_delete_ms: u64,
    /// Number of shards; fixed for the lifetime of a cache directory
    pub database_shards: u32,
    /// Flush attempts per pending write before it is dropped
    pub flush_retry_limit: u32,
    /// Delay between flush attempts (multiplied by the attempt number)
    pub flush_retry_backoff_ms: u64,
    /// Period of the background eviction check
    pub eviction_interval_secs: u64,
    /// Compact a shard log once it holds this many records per live entry
    pub log_compaction_ratio: u64,
    /// fsync the shard log on every append
    pub sync_log_writes: bool,
    /// How long `stop` waits for the write queue to drain
    pub shutdown_drain_timeout_secs: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_location: PathBuf::new(),
            web_root: None,
            cache_size_mb: 1024,
            write_queue_memory_mb: 100,
            eviction_sweep_size_mb: 1,
            min_age_to_delete_ms: 10_000,
            database_shards: 8,
            flush_retry_limit: 3,
            flush_retry_backoff_ms: 50,
            eviction_interval_secs: 30,
            log_compaction_ratio: 4,
            sync_log_writes: true,
            shutdown_drain_timeout_secs: 30,
        }
    }
}

impl CacheOptions {
    /// Create options with defaults for the given cache directory
    pub fn new(cache_location: impl Into<PathBuf>) -> Self {
        Self {
            cache_location: cache_location.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size_mb.saturating_mul(MB)
    }

    #[must_use]
    pub fn write_queue_bytes(&self) -> u64 {
        self.write_queue_memory_mb.saturating_mul(MB)
    }

    #[must_use]
    pub fn eviction_sweep_bytes(&self) -> u64 {
        self.eviction_sweep_size_mb.saturating_mul(MB)
    }

    #[must_use]
    pub fn min_age_to_delete(&self) -> Duration {
        Duration::from_millis(self.min_age_to_delete_ms)
    }

    #[must_use]
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }

    #[must_use]
    pub fn flush_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.flush_retry_backoff_ms)
    }

    #[must_use]
    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_timeout_secs)
    }

    /// Validate the options
    ///
    /// Returns a fatal error for settings the cache cannot run with, and a
    /// list of non-fatal issues for settings that work but are suspicious.
    pub fn validate(&self) -> Result<Vec<Issue>> {
        if self.cache_location.as_os_str().is_empty() {
            return Err(Error::configuration("cache_location is not set"));
        }
        if !self.cache_location.is_absolute() {
            return Err(Error::configuration(format!(
                "cache_location must be an absolute path, got {}",
                self.cache_location.display()
            )));
        }
        if self.database_shards == 0 || self.database_shards > MAX_SHARDS {
            return Err(Error::configuration(format!(
                "database_shards must be between 1 and {MAX_SHARDS}, got {}",
                self.database_shards
            )));
        }
        if self.cache_size_mb == 0 {
            return Err(Error::configuration("cache_size_mb must be greater than zero"));
        }
        if self.eviction_sweep_size_mb == 0 {
            return Err(Error::configuration(
                "eviction_sweep_size_mb must be greater than zero",
            ));
        }

        if let Some(web_root) = &self.web_root {
            if is_within(&self.cache_location, web_root) {
                return Err(Error::ConfigurationConflict(format!(
                    "cache_location {} resolves inside the served web root {}",
                    self.cache_location.display(),
                    web_root.display()
                )));
            }
        }

        let mut issues = Vec::new();
        if self.write_queue_memory_mb > self.cache_size_mb {
            issues.push(Issue::warning(
                "options",
                format!(
                    "write_queue_memory_mb ({}) exceeds cache_size_mb ({}); the write queue budget is oversubscribed",
                    self.write_queue_memory_mb, self.cache_size_mb
                ),
            ));
        }
        if self.eviction_sweep_size_mb > self.cache_size_mb {
            issues.push(Issue::warning(
                "options",
                format!(
                    "eviction_sweep_size_mb ({}) exceeds cache_size_mb ({}); every sweep empties the cache",
                    self.eviction_sweep_size_mb, self.cache_size_mb
                ),
            ));
        }
        if self.cache_size_mb < MIN_RECOMMENDED_CACHE_MB {
            issues.push(Issue::warning(
                "options",
                format!(
                    "cache_size_mb ({}) is below the recommended minimum of {MIN_RECOMMENDED_CACHE_MB}",
                    self.cache_size_mb
                ),
            ));
        }
        if self.write_queue_memory_mb == 0 {
            issues.push(Issue::info(
                "options",
                "write_queue_memory_mb is 0; every write is performed synchronously",
            ));
        }
        Ok(issues)
    }
}

/// Check whether `path` is `root` or lies below it
///
/// Both paths are canonicalised when they exist so symlinks cannot hide the
/// overlap; otherwise they are compared lexically.
fn is_within(path: &Path, root: &Path) -> bool {
    let path = path
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexically(path));
    let root = root
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexically(root));
    path.starts_with(&root)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
