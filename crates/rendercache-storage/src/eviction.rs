//! Capacity-based eviction
//!
//! A sweep merges the per-shard access-ordered entry lists into one global
//! least-recently-used order and deletes from the front until enough space is
//! freed. Entries accessed within the minimum age are never deleted; since the
//! merged order is ascending by access time, the first such entry ends the
//! sweep.
//!
//! Candidate lists are snapshots. Each deletion re-checks the entry under its
//! shard's locks and skips it if it was accessed after the snapshot was taken.

use crate::meta_store::MetaStore;
use crate::stats::CacheStats;
use parking_lot::Mutex;
use rendercache_common::{now_millis, CacheEntry, CacheOptions};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one sweep
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub bytes_freed: u64,
    pub entries_evicted: usize,
    /// Candidates skipped because they were accessed or removed mid-sweep
    pub raced: usize,
    /// Sweep ended on an entry younger than the minimum age
    pub stopped_at_min_age: bool,
}

pub struct EvictionManager {
    store: Arc<MetaStore>,
    cache_size_bytes: u64,
    sweep_bytes: u64,
    min_age_ms: u64,
    stats: Arc<CacheStats>,
    sweep_lock: Mutex<()>,
    wake: Notify,
}

impl EvictionManager {
    pub fn new(store: Arc<MetaStore>, options: &CacheOptions, stats: Arc<CacheStats>) -> Self {
        Self {
            store,
            cache_size_bytes: options.cache_size_bytes(),
            sweep_bytes: options.eviction_sweep_bytes(),
            min_age_ms: options.min_age_to_delete_ms,
            stats,
            sweep_lock: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    /// Whether the loaded shards exceed the size budget
    #[must_use]
    pub fn needs_sweep(&self) -> bool {
        self.store.total_cache_bytes() > self.cache_size_bytes
    }

    /// Ask the background loop to check the budget now
    pub fn request_sweep(&self) {
        self.wake.notify_one();
    }

    /// Load every shard and sweep if over budget
    pub fn sweep_if_needed(&self) -> Option<SweepReport> {
        self.store.load_all();
        if self.needs_sweep() {
            Some(self.sweep())
        } else {
            None
        }
    }

    /// Free space, oldest-accessed first
    ///
    /// Frees at least the configured sweep size, or the whole overage if that
    /// is larger, unless eligible entries run out first. Does nothing while
    /// the cache is within budget. Performs blocking I/O.
    pub fn sweep(&self) -> SweepReport {
        let _guard = self.sweep_lock.lock();
        self.store.load_all();

        let bytes_before = self.store.total_cache_bytes();
        let mut report = SweepReport {
            bytes_before,
            bytes_after: bytes_before,
            ..Default::default()
        };
        if bytes_before <= self.cache_size_bytes {
            debug!("Cache within budget ({} bytes), nothing to sweep", bytes_before);
            return report;
        }
        let target = self.sweep_bytes.max(bytes_before - self.cache_size_bytes);

        let candidates: Vec<Vec<CacheEntry>> = self
            .store
            .shards()
            .iter()
            .map(|shard| shard.index().entries_by_access())
            .collect();

        let mut heap = BinaryHeap::new();
        for (shard, entries) in candidates.iter().enumerate() {
            if let Some(first) = entries.first() {
                heap.push(Reverse((first.accessed_ms, shard, 0usize)));
            }
        }

        let now = now_millis();
        while report.bytes_freed < target {
            let Some(Reverse((_, shard_idx, pos))) = heap.pop() else {
                break;
            };
            let entry = &candidates[shard_idx][pos];
            if let Some(next) = candidates[shard_idx].get(pos + 1) {
                heap.push(Reverse((next.accessed_ms, shard_idx, pos + 1)));
            }

            if entry.idle_ms(now) < self.min_age_ms {
                report.stopped_at_min_age = true;
                break;
            }

            let shard = &self.store.shards()[shard_idx];
            match shard.evict(&entry.relative_path, entry.accessed_ms) {
                Ok(Some(freed)) => {
                    report.bytes_freed += freed;
                    report.entries_evicted += 1;
                    CacheStats::incr(&self.stats.evictions);
                    self.stats.evicted_bytes.fetch_add(freed, Ordering::Relaxed);
                }
                Ok(None) => report.raced += 1,
                Err(e) => {
                    warn!(
                        "Failed to evict {} from shard {}: {}",
                        entry.relative_path,
                        shard.id(),
                        e
                    );
                }
            }
        }

        report.bytes_after = self.store.total_cache_bytes();
        info!(
            "Eviction sweep freed {} bytes ({} entries, {} raced): {} -> {} bytes",
            report.bytes_freed,
            report.entries_evicted,
            report.raced,
            report.bytes_before,
            report.bytes_after
        );
        report
    }

    /// Periodic eviction loop
    ///
    /// Checks the budget every `interval` and whenever a sweep is requested,
    /// until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.wake.notified() => {}
            }

            let manager = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || manager.sweep_if_needed()).await {
                Ok(Some(report)) if report.bytes_after > self.cache_size_bytes => {
                    warn!(
                        "Cache still over budget after sweep ({} bytes); remaining entries are too young",
                        report.bytes_after
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Eviction sweep task failed: {}", e),
            }
        }
        debug!("Eviction loop exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::IssueSink;
    use crate::layout::relative_path_for;
    use rendercache_common::{CacheKey, CachedBlob, MB};
    use tempfile::tempdir;

    fn setup(root: &std::path::Path, min_age_ms: u64) -> (Arc<MetaStore>, EvictionManager) {
        let mut options = CacheOptions::new(root);
        options.cache_size_mb = 1;
        options.eviction_sweep_size_mb = 1;
        options.min_age_to_delete_ms = min_age_ms;
        options.database_shards = 3;
        options.sync_log_writes = false;
        let stats = Arc::new(CacheStats::default());
        let store = Arc::new(
            MetaStore::open(&options, Arc::new(IssueSink::new()), Arc::clone(&stats)).unwrap(),
        );
        let manager = EvictionManager::new(Arc::clone(&store), &options, stats);
        (store, manager)
    }

    /// Write `count` blobs of `size` bytes, spacing access times 1ms apart
    fn fill(store: &MetaStore, count: usize, size: usize, base_ms: u64) -> Vec<CacheKey> {
        let keys: Vec<CacheKey> = (0..count).map(|n| CacheKey::new(format!("/e/{n}"))).collect();
        for (n, key) in keys.iter().enumerate() {
            store
                .write_blob(key, &CachedBlob::new(vec![0u8; size], "image/png"))
                .unwrap();
            store
                .shard_for(key)
                .index()
                .bump_access_at(&relative_path_for(key), base_ms + n as u64);
        }
        keys
    }

    #[test]
    fn test_within_budget_is_noop() {
        let dir = tempdir().unwrap();
        let (store, manager) = setup(dir.path(), 0);
        fill(&store, 4, 1024, 1);
        assert!(!manager.needs_sweep());
        assert_eq!(manager.sweep().bytes_freed, 0);
        assert_eq!(store.shards().iter().map(|s| s.index().len()).sum::<usize>(), 4);
    }

    #[test]
    fn test_sweep_removes_oldest_first() {
        let dir = tempdir().unwrap();
        let (store, manager) = setup(dir.path(), 0);
        let keys = fill(&store, 12, 128 * 1024, 1_000);
        assert!(manager.needs_sweep());

        let report = manager.sweep();
        assert!(report.bytes_freed >= MB);
        assert!(report.bytes_after <= MB);
        assert!(!store.contains_indexed(&keys[0]));
        assert!(store.contains_indexed(&keys[11]));

        // Survivors form a suffix of the access order
        let survivors: Vec<bool> = keys.iter().map(|k| store.contains_indexed(k)).collect();
        let first_kept = survivors.iter().position(|s| *s).unwrap();
        assert!(survivors[first_kept..].iter().all(|s| *s));
    }

    #[test]
    fn test_young_entries_never_evicted() {
        let dir = tempdir().unwrap();
        let (store, manager) = setup(dir.path(), 60_000);
        let keys = fill(&store, 12, 128 * 1024, now_millis());

        let report = manager.sweep();
        assert_eq!(report.bytes_freed, 0);
        assert_eq!(report.entries_evicted, 0);
        assert!(report.stopped_at_min_age);
        assert!(keys.iter().all(|k| store.contains_indexed(k)));
    }

    #[test]
    fn test_touched_candidate_skipped() {
        let dir = tempdir().unwrap();
        let (store, manager) = setup(dir.path(), 0);
        let keys = fill(&store, 12, 128 * 1024, 1_000);

        // Oldest entry is rewritten with a fresh access time after filling;
        // it is no longer the oldest, so the sweep must keep it.
        let shard = store.shard_for(&keys[0]);
        shard.index().bump_access_at(&relative_path_for(&keys[0]), 5_000);
        manager.sweep();
        assert!(store.contains_indexed(&keys[0]));
        assert!(!store.contains_indexed(&keys[1]));
    }
}
