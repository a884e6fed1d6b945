//! Index versus disk consistency, drift recovery and shard routing

use rand::Rng;
use rendercache_storage::layout::{parent_folder, relative_path_for};
use rendercache_storage::{
    CacheKey, CacheOptions, CachedBlob, DiskCache, Error, FolderIndex, Lookup, ProducerError,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn options(root: &Path, shards: u32) -> CacheOptions {
    let mut options = CacheOptions::new(root);
    options.database_shards = shards;
    options.sync_log_writes = false;
    options
}

async fn produce(key: CacheKey) -> Result<CachedBlob, ProducerError> {
    Ok(CachedBlob::new(key.as_str().as_bytes().to_vec(), "image/gif"))
}

#[test]
fn populate_makes_every_lookup_definitive() {
    let dir = tempdir().unwrap();
    let folder = dir.path().join("ab/cd");
    fs::create_dir_all(&folder).unwrap();

    let mut rng = rand::thread_rng();
    let mut present = HashSet::new();
    for _ in 0..200 {
        let name = format!("{:016x}.blob", rng.r#gen::<u64>());
        let len = rng.gen_range(1..4096);
        fs::write(folder.join(&name), vec![0u8; len]).unwrap();
        present.insert(name);
    }

    let index = FolderIndex::new(dir.path(), None);
    index.populate("ab/cd").unwrap();

    for name in &present {
        let lookup = index.lookup(&format!("ab/cd/{name}")).unwrap();
        assert!(matches!(lookup, Lookup::Hit(_)), "{name} not indexed");
    }
    for _ in 0..200 {
        let name = format!("{:016x}.blob", rng.r#gen::<u64>());
        if !present.contains(&name) {
            assert_eq!(index.lookup(&format!("ab/cd/{name}")).unwrap(), Lookup::Absent);
        }
    }
    assert_eq!(index.len(), present.len());
}

#[tokio::test]
async fn external_deletion_triggers_rescan() {
    let dir = tempdir().unwrap();
    let cache = DiskCache::open(options(dir.path(), 2)).unwrap();
    cache.start().await.unwrap();
    let cancel = CancellationToken::new();

    let key = CacheKey::new("/deleted/out/of/band.png");
    let sibling = CacheKey::new("/still/here.png");
    cache.get_or_create_bytes(key.clone(), produce, &cancel).await.unwrap();
    cache.get_or_create_bytes(sibling.clone(), produce, &cancel).await.unwrap();
    cache.flush().await;

    let shard = cache.store().shard_for(&key).clone();
    let relative = relative_path_for(&key);
    fs::remove_file(shard.index().physical_path(&relative).unwrap()).unwrap();

    assert!(cache.store().get_metadata(&key).unwrap().is_none());
    assert_eq!(cache.stats().drift_events, 1);

    // The folder was re-listed and now reflects the disk exactly
    let folder = parent_folder(&relative);
    assert!(shard.index().is_populated(folder));
    assert_eq!(shard.index().lookup(&relative).unwrap(), Lookup::Absent);

    // Other entries are unaffected and the key can be rebuilt
    assert!(cache.store().get_metadata(&sibling).unwrap().is_some());
    let rebuilt = cache.get_or_create_bytes(key.clone(), produce, &cancel).await.unwrap();
    assert_eq!(rebuilt.bytes.as_ref(), key.as_bytes());
    cache.stop().await;
}

#[tokio::test]
async fn truncated_blob_is_never_served() {
    let dir = tempdir().unwrap();
    let cache = DiskCache::open(options(dir.path(), 2)).unwrap();
    cache.start().await.unwrap();
    let cancel = CancellationToken::new();

    let key = CacheKey::new("/half/written.webp");
    cache.get_or_create_bytes(key.clone(), produce, &cancel).await.unwrap();
    cache.flush().await;

    let path = cache
        .store()
        .shard_for(&key)
        .index()
        .physical_path(&relative_path_for(&key))
        .unwrap();
    let data = fs::read(&path).unwrap();
    fs::write(&path, &data[..data.len() / 2]).unwrap();

    // Treated as a miss and rebuilt, never returned half-written
    let response = cache
        .get_or_create(key.clone(), produce, &cancel)
        .await
        .unwrap();
    assert_eq!(response.blob.bytes.as_ref(), key.as_bytes());
    cache.stop().await;
}

#[tokio::test]
async fn shard_routing_is_stable_across_restarts() {
    let dir = tempdir().unwrap();
    let key = CacheKey::new("w=300&h=200&mode=crop;/gallery/2019/beach.jpg");

    let shard = {
        let cache = DiskCache::open(options(dir.path(), 4)).unwrap();
        let first = cache.resolve(&key);
        for _ in 0..1000 {
            assert_eq!(cache.resolve(&key), first);
        }
        cache.start().await.unwrap();
        let cancel = CancellationToken::new();
        cache.get_or_create_bytes(key.clone(), produce, &cancel).await.unwrap();
        cache.stop().await;
        first
    };

    let cache = DiskCache::open(options(dir.path(), 4)).unwrap();
    cache.start().await.unwrap();
    assert_eq!(cache.resolve(&key), shard);
    let owner = cache.store().shard(shard).unwrap();
    assert!(owner.contains_indexed(&key));
    cache.stop().await;
}

#[tokio::test]
async fn instance_conflicts_and_layout_changes_are_fatal() {
    let dir = tempdir().unwrap();
    let first = DiskCache::open(options(dir.path(), 4)).unwrap();
    let err = DiskCache::open(options(dir.path(), 4)).unwrap_err();
    assert!(matches!(err, Error::ConfigurationConflict(_)));
    drop(first);

    let err = DiskCache::open(options(dir.path(), 8)).unwrap_err();
    assert!(matches!(err, Error::ShardCountMismatch { on_disk: 4, configured: 8, .. }));

    let legacy = tempdir().unwrap();
    fs::create_dir_all(legacy.path().join("a1")).unwrap();
    fs::write(legacy.path().join("a1/a1b2c3.jpg"), b"old").unwrap();
    let err = DiskCache::open(options(legacy.path(), 4)).unwrap_err();
    assert!(matches!(err, Error::LegacyLayout { .. }));
}

#[tokio::test]
async fn buffered_write_is_a_hit_before_flush() {
    let dir = tempdir().unwrap();
    // Not started: nothing drains the queue
    let cache = DiskCache::open(options(dir.path(), 2)).unwrap();
    let cancel = CancellationToken::new();
    let key = CacheKey::new("/queued.png");

    let built = cache.get_or_create_bytes(key.clone(), produce, &cancel).await.unwrap();
    assert!(cache.queue().contains(&key));
    assert!(!cache.store().contains_indexed(&key));

    let again = cache
        .get_or_create(
            key.clone(),
            |_| async { Err::<CachedBlob, ProducerError>("must not build twice".into()) },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(again.blob, built);
    assert_eq!(cache.stats().buffered_hits, 1);
}
