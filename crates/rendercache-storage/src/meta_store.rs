//! Sharded metadata store
//!
//! Owns the cache directory: takes the instance lock, validates the layout
//! manifest, and routes every key to exactly one [`Shard`]. A shard that fails
//! to load is reported and keeps serving what it can; it never stops the
//! other shards.

use crate::issues::IssueSink;
use crate::layout::{self, DirectoryLock, LayoutManifest};
use crate::shard::{Shard, ShardConfig, ShardStats, VerifyReport};
use crate::stats::CacheStats;
use rendercache_common::{CacheEntry, CacheKey, CacheOptions, CachedBlob, Issue, Result, ShardId};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the throwaway file used to check write permission
const PROBE_FILE: &str = ".rendercache.probe";

pub struct MetaStore {
    root: PathBuf,
    shards: Vec<Arc<Shard>>,
    manifest: LayoutManifest,
    issues: Arc<IssueSink>,
    _lock: DirectoryLock,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("root", &self.root)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl MetaStore {
    /// Open the store at `options.cache_location`
    ///
    /// Fails if another instance holds the directory, if the directory holds
    /// a legacy layout, or if the shard count differs from the one the
    /// directory was created with. Shard logs are not read yet.
    pub fn open(options: &CacheOptions, issues: Arc<IssueSink>, stats: Arc<CacheStats>) -> Result<Self> {
        let root = options.cache_location.clone();
        fs::create_dir_all(&root)?;
        let lock = layout::acquire_lock(&root)?;
        let manifest = layout::prepare(&root, options.database_shards)?;
        probe_permissions(&root, &issues);

        let config = ShardConfig {
            sync_log_writes: options.sync_log_writes,
            log_compaction_ratio: options.log_compaction_ratio,
        };
        let shards = (0..manifest.shards)
            .map(|id| {
                Arc::new(Shard::new(
                    &root,
                    id,
                    config.clone(),
                    Arc::clone(&issues),
                    Arc::clone(&stats),
                ))
            })
            .collect();

        info!("Opened metadata store at {:?} ({} shards)", root, manifest.shards);
        Ok(Self {
            root,
            shards,
            manifest,
            issues,
            _lock: lock,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn manifest(&self) -> &LayoutManifest {
        &self.manifest
    }

    /// Shard that owns a key
    #[must_use]
    pub fn resolve(&self, key: &CacheKey) -> ShardId {
        layout::shard_for(key, self.shards.len() as u32)
    }

    /// Shard by id
    #[must_use]
    pub fn shard(&self, id: ShardId) -> Option<&Arc<Shard>> {
        self.shards.get(id as usize)
    }

    /// Shard that owns a key
    #[must_use]
    pub fn shard_for(&self, key: &CacheKey) -> &Arc<Shard> {
        // resolve() is always below shards.len(), which is at least one
        &self.shards[self.resolve(key) as usize]
    }

    #[must_use]
    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// Entry for a key, loading its shard on first use
    pub fn get_metadata(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.shard_for(key).get_metadata(key)
    }

    /// Persist a blob and record it in the owning shard
    pub fn write_blob(&self, key: &CacheKey, blob: &CachedBlob) -> Result<CacheEntry> {
        self.shard_for(key).write_blob(key, blob)
    }

    pub fn read_blob(&self, key: &CacheKey) -> Result<Option<CachedBlob>> {
        self.shard_for(key).read_blob(key)
    }

    /// Index-only existence check
    #[must_use]
    pub fn contains_indexed(&self, key: &CacheKey) -> bool {
        self.shard_for(key).contains_indexed(key)
    }

    /// Load every shard, reporting failures as issues
    pub fn load_all(&self) {
        for shard in &self.shards {
            if let Err(e) = shard.ensure_loaded() {
                self.issues.report(Issue::error(
                    layout::shard_dir_name(shard.id()),
                    format!("failed to load: {e}"),
                ));
            }
        }
    }

    /// Sum of indexed bytes over loaded shards
    #[must_use]
    pub fn total_cache_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.total_bytes()).sum()
    }

    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.shards.iter().map(|s| s.stats()).collect()
    }

    /// Re-scan every shard from disk
    pub fn verify_all(&self) -> Vec<Result<VerifyReport>> {
        self.shards.iter().map(|s| s.verify()).collect()
    }

    /// Flush every shard log to disk
    pub fn sync_all(&self) -> Result<()> {
        let mut first_error = None;
        for shard in &self.shards {
            if let Err(e) = shard.sync() {
                warn!("Failed to sync shard {}: {}", shard.id(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Check that the cache directory is writable, recording an issue if not
fn probe_permissions(root: &Path, issues: &IssueSink) {
    let probe = root.join(PROBE_FILE);
    let result = fs::write(&probe, b"probe").and_then(|()| fs::remove_file(&probe));
    if let Err(e) = result {
        issues.report(Issue::error(
            "cache_location",
            format!("{} is not writable: {e}", root.display()),
        ));
    }
}
