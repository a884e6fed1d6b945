//! Eviction behaviour at the cache level

use rendercache_common::{now_millis, MB};
use rendercache_storage::layout::relative_path_for;
use rendercache_storage::{CacheKey, CacheOptions, CachedBlob, DiskCache};
use std::path::Path;
use tempfile::tempdir;

fn open(root: &Path, min_age_ms: u64) -> DiskCache {
    let mut options = CacheOptions::new(root);
    options.cache_size_mb = 1;
    options.eviction_sweep_size_mb = 1;
    options.min_age_to_delete_ms = min_age_ms;
    options.sync_log_writes = false;
    DiskCache::open(options).unwrap()
}

/// Write `count` entries of `size` bytes, access times 1ms apart from `base_ms`
fn fill(cache: &DiskCache, count: usize, size: usize, base_ms: u64) -> Vec<CacheKey> {
    let store = cache.store();
    let keys: Vec<CacheKey> = (0..count)
        .map(|n| CacheKey::new(format!("/thumbs/{n}.png")))
        .collect();
    for (n, key) in keys.iter().enumerate() {
        store
            .write_blob(key, &CachedBlob::new(vec![n as u8; size], "image/png"))
            .unwrap();
        assert!(store
            .shard_for(key)
            .index()
            .bump_access_at(&relative_path_for(key), base_ms + n as u64));
    }
    keys
}

#[tokio::test]
async fn sweep_keeps_most_recently_accessed() {
    let dir = tempdir().unwrap();
    let cache = open(dir.path(), 0);
    let keys = fill(&cache, 2000, 1024, now_millis() - 10_000);
    assert!(cache.total_cache_bytes() > MB);

    let report = cache.sweep().await.unwrap();
    assert!(report.entries_evicted > 0);
    assert!(cache.total_cache_bytes() <= MB);
    assert_eq!(report.bytes_after, cache.total_cache_bytes());

    let kept: Vec<bool> = keys
        .iter()
        .map(|k| cache.store().contains_indexed(k))
        .collect();
    let retained = kept.iter().filter(|k| **k).count();
    assert_eq!(retained, keys.len() - report.entries_evicted);
    // Exactly the newest entries survive
    assert!(kept[..keys.len() - retained].iter().all(|k| !k));
    assert!(kept[keys.len() - retained..].iter().all(|k| *k));
}

#[tokio::test]
async fn sweep_frees_nothing_when_all_entries_are_young() {
    let dir = tempdir().unwrap();
    let cache = open(dir.path(), 60_000);
    let keys = fill(&cache, 1500, 1024, now_millis());
    let before = cache.total_cache_bytes();

    let report = cache.sweep().await.unwrap();
    assert_eq!(report.bytes_freed, 0);
    assert_eq!(report.entries_evicted, 0);
    assert_eq!(cache.total_cache_bytes(), before);
    assert!(keys.iter().all(|k| cache.store().contains_indexed(k)));
}

#[tokio::test]
async fn sweep_converges_or_exhausts_eligible_entries() {
    let dir = tempdir().unwrap();
    let cache = open(dir.path(), 5_000);
    let now = now_millis();

    // Old half is evictable, young half is protected
    let old = fill(&cache, 800, 2048, now - 60_000);
    let store = cache.store();
    let young: Vec<CacheKey> = (0..800)
        .map(|n| CacheKey::new(format!("/fresh/{n}")))
        .collect();
    for key in &young {
        store
            .write_blob(key, &CachedBlob::new(vec![1u8; 2048], "image/png"))
            .unwrap();
    }

    let report = cache.sweep().await.unwrap();
    assert!(report.bytes_after <= MB || old.iter().all(|k| !store.contains_indexed(k)));
    assert!(young.iter().all(|k| store.contains_indexed(k)));
}

#[tokio::test]
async fn evicted_entries_stay_gone_after_restart() {
    let dir = tempdir().unwrap();
    let (keys, evicted) = {
        let cache = open(dir.path(), 0);
        let keys = fill(&cache, 1200, 1024, 1_000);
        let report = cache.sweep().await.unwrap();
        cache.stop().await;
        (keys, report.entries_evicted)
    };

    let cache = open(dir.path(), 0);
    cache.start().await.unwrap();
    let present = keys
        .iter()
        .filter(|k| cache.store().contains_indexed(k))
        .count();
    assert_eq!(present, keys.len() - evicted);
    assert!(cache.total_cache_bytes() <= MB);
    cache.stop().await;
}
