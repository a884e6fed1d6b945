//! Disk cache composition root
//!
//! [`DiskCache`] wires the metadata store, write-behind queue, eviction
//! manager and build coordinator together and owns their background tasks.
//! It is created explicitly and passed to request handlers; `start` and `stop`
//! are driven by the embedding process.

use crate::coordinator::{BuildCoordinator, CacheResponse, ProducerError, ResponseSource};
use crate::eviction::{EvictionManager, SweepReport};
use crate::index::PopulateReport;
use crate::issues::IssueSink;
use crate::layout;
use crate::meta_store::MetaStore;
use crate::shard::{ShardStats, VerifyReport};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::write_queue::{StopReport, WriteBehindQueue, WriteTicket};
use async_trait::async_trait;
use parking_lot::Mutex;
use rendercache_common::{CacheKey, CacheOptions, CachedBlob, Error, Issue, Result, ShardId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace period for the eviction loop to notice shutdown
const EVICTION_STOP_GRACE: Duration = Duration::from_secs(5);

/// Capability interface of a cache backend
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Cached blob for a key, from memory or disk
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedBlob>>;

    /// Re-list one folder of a shard from disk
    async fn populate(&self, shard: ShardId, folder: &str) -> Result<PopulateReport>;

    /// Queue a blob for persistence
    async fn enqueue(&self, key: CacheKey, blob: CachedBlob) -> Result<WriteTicket>;

    /// Run one eviction sweep
    async fn sweep(&self) -> Result<SweepReport>;
}

pub struct DiskCache {
    options: CacheOptions,
    issues: Arc<IssueSink>,
    stats: Arc<CacheStats>,
    store: Arc<MetaStore>,
    queue: Arc<WriteBehindQueue>,
    eviction: Arc<EvictionManager>,
    coordinator: BuildCoordinator,
    shutdown: CancellationToken,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("location", &self.options.cache_location)
            .field("shards", &self.store.shards().len())
            .finish()
    }
}

impl DiskCache {
    /// Validate options and open the cache directory
    ///
    /// Configuration problems that make the cache unsafe (a location inside
    /// the web root, a second instance on the same directory, a layout from
    /// an older version) fail here. Suspicious but workable settings are
    /// recorded as issues.
    pub fn open(options: CacheOptions) -> Result<Self> {
        let issues = Arc::new(IssueSink::new());
        issues.extend(options.validate()?);

        let stats = Arc::new(CacheStats::default());
        let store = Arc::new(MetaStore::open(
            &options,
            Arc::clone(&issues),
            Arc::clone(&stats),
        )?);
        let queue = Arc::new(WriteBehindQueue::new(
            Arc::clone(&store),
            &options,
            Arc::clone(&stats),
            Arc::clone(&issues),
        ));
        let eviction = Arc::new(EvictionManager::new(
            Arc::clone(&store),
            &options,
            Arc::clone(&stats),
        ));
        let coordinator =
            BuildCoordinator::new(Arc::clone(&store), Arc::clone(&queue), Arc::clone(&stats));

        info!(
            "Opened disk cache at {:?}: {} MB budget, {} shards",
            options.cache_location, options.cache_size_mb, options.database_shards
        );
        Ok(Self {
            options,
            issues,
            stats,
            store,
            queue,
            eviction,
            coordinator,
            shutdown: CancellationToken::new(),
            eviction_task: Mutex::new(None),
        })
    }

    /// Preload shard logs and start the flush worker and eviction loop
    pub async fn start(&self) -> Result<()> {
        if self.queue.is_stopping() {
            return Err(Error::ShuttingDown);
        }

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.load_all())
            .await
            .map_err(|e| Error::internal(format!("shard preload failed: {e}")))?;

        self.queue.start();

        let mut task = self.eviction_task.lock();
        if task.is_none() {
            let eviction = Arc::clone(&self.eviction);
            let interval = self.options.eviction_interval();
            let shutdown = self.shutdown.clone();
            *task = Some(tokio::spawn(eviction.run(interval, shutdown)));
        }

        info!(
            "Disk cache started: {} bytes across {} shards",
            self.store.total_cache_bytes(),
            self.store.shards().len()
        );
        Ok(())
    }

    /// Stop accepting work, drain the write queue and sync shard logs
    pub async fn stop(&self) -> StopReport {
        info!("Stopping disk cache");
        self.shutdown.cancel();
        let report = self.queue.stop(self.options.shutdown_drain_timeout()).await;

        let task = self.eviction_task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(EVICTION_STOP_GRACE, task).await.is_err() {
                warn!("Eviction loop did not stop in time; aborting");
                abort.abort();
            }
        }

        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.sync_all()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to sync shard logs: {}", e),
            Err(e) => error!("Shard sync task failed: {}", e),
        }
        info!(
            "Disk cache stopped ({} writes abandoned)",
            report.abandoned
        );
        report
    }

    /// Cached bytes for `key`, produced at most once across concurrent callers
    pub async fn get_or_create_bytes<F, Fut>(
        &self,
        key: CacheKey,
        producer: F,
        cancel: &CancellationToken,
    ) -> Result<CachedBlob>
    where
        F: FnOnce(CacheKey) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<CachedBlob, ProducerError>> + Send + 'static,
    {
        self.get_or_create(key, producer, cancel)
            .await
            .map(|response| response.blob)
    }

    /// Like [`get_or_create_bytes`](Self::get_or_create_bytes), also reporting
    /// where the bytes came from
    pub async fn get_or_create<F, Fut>(
        &self,
        key: CacheKey,
        producer: F,
        cancel: &CancellationToken,
    ) -> Result<CacheResponse>
    where
        F: FnOnce(CacheKey) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<CachedBlob, ProducerError>> + Send + 'static,
    {
        let response = self.coordinator.get_or_create(key, producer, cancel).await?;
        if response.source == ResponseSource::Built && self.eviction.needs_sweep() {
            self.eviction.request_sweep();
        }
        Ok(response)
    }

    /// Non-fatal problems found so far
    #[must_use]
    pub fn issues(&self) -> Vec<Issue> {
        self.issues.snapshot()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.store.shard_stats()
    }

    /// Indexed bytes over loaded shards
    #[must_use]
    pub fn total_cache_bytes(&self) -> u64 {
        self.store.total_cache_bytes()
    }

    /// Shard that owns a key
    #[must_use]
    pub fn resolve(&self, key: &CacheKey) -> ShardId {
        self.store.resolve(key)
    }

    /// Blob path of a key relative to its shard's blob directory
    #[must_use]
    pub fn relative_path(&self, key: &CacheKey) -> String {
        layout::relative_path_for(key)
    }

    /// Run one eviction sweep on a blocking thread
    pub async fn sweep(&self) -> Result<SweepReport> {
        let eviction = Arc::clone(&self.eviction);
        tokio::task::spawn_blocking(move || eviction.sweep())
            .await
            .map_err(|e| Error::internal(format!("sweep task failed: {e}")))
    }

    /// Re-scan every shard from disk, rewriting the logs to match
    pub async fn verify(&self) -> Result<Vec<VerifyReport>> {
        let store = Arc::clone(&self.store);
        let results = tokio::task::spawn_blocking(move || store.verify_all())
            .await
            .map_err(|e| Error::internal(format!("verify task failed: {e}")))?;
        results.into_iter().collect()
    }

    /// Wait until every queued write has been persisted
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<WriteBehindQueue> {
        &self.queue
    }

    #[must_use]
    pub fn coordinator(&self) -> &BuildCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn eviction(&self) -> &Arc<EvictionManager> {
        &self.eviction
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        // Background tasks hold the store; they must exit to release the directory lock
        self.shutdown.cancel();
        self.queue.close();
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    fn name(&self) -> &str {
        "disk"
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedBlob>> {
        if let Some(blob) = self.queue.get(key) {
            return Ok(Some(blob));
        }
        let store = Arc::clone(&self.store);
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.read_blob(&key))
            .await
            .map_err(|e| Error::internal(format!("lookup task failed: {e}")))?
    }

    async fn populate(&self, shard: ShardId, folder: &str) -> Result<PopulateReport> {
        let shard = self
            .store
            .shard(shard)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("no shard {shard}")))?;
        let folder = folder.to_string();
        tokio::task::spawn_blocking(move || {
            shard.ensure_loaded()?;
            shard.index().populate(&folder)
        })
        .await
        .map_err(|e| Error::internal(format!("populate task failed: {e}")))?
    }

    async fn enqueue(&self, key: CacheKey, blob: CachedBlob) -> Result<WriteTicket> {
        self.queue.enqueue(key, blob).await
    }

    async fn sweep(&self) -> Result<SweepReport> {
        DiskCache::sweep(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options(root: &std::path::Path) -> CacheOptions {
        let mut options = CacheOptions::new(root);
        options.database_shards = 2;
        options.sync_log_writes = false;
        options
    }

    #[test]
    fn test_open_reports_suspicious_options() {
        let dir = tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.cache_size_mb = 10;
        let cache = DiskCache::open(opts).unwrap();
        assert!(cache
            .issues()
            .iter()
            .any(|i| i.message.contains("recommended minimum")));
    }

    #[test]
    fn test_open_inside_web_root_fails() {
        let dir = tempdir().unwrap();
        let mut opts = options(&dir.path().join("public/cache"));
        opts.web_root = Some(dir.path().join("public"));
        let err = DiskCache::open(opts).unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));
    }

    #[tokio::test]
    async fn test_backend_round_trip() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(options(dir.path())).unwrap();
        cache.start().await.unwrap();
        let backend: &dyn CacheBackend = &cache;
        let key = CacheKey::new("/trait");

        assert!(backend.lookup(&key).await.unwrap().is_none());
        let ticket = backend
            .enqueue(key.clone(), CachedBlob::new(b"abc".to_vec(), "text/plain"))
            .await
            .unwrap();
        ticket.written().await.unwrap();
        assert_eq!(
            backend.lookup(&key).await.unwrap().unwrap().bytes.as_ref(),
            b"abc"
        );

        let shard = cache.resolve(&key);
        let report = backend.populate(shard, "").await.unwrap();
        assert_eq!(report.folders, 1);
        assert!(backend.populate(99, "").await.is_err());
        assert_eq!(backend.sweep().await.unwrap().bytes_freed, 0);

        cache.stop().await;
    }

    #[tokio::test]
    async fn test_dropping_started_cache_releases_directory() {
        let dir = tempdir().unwrap();
        {
            let cache = DiskCache::open(options(dir.path())).unwrap();
            cache.start().await.unwrap();
            cache
                .queue()
                .enqueue(CacheKey::new("/pending"), CachedBlob::new(vec![1u8; 64], "image/png"))
                .await
                .unwrap();
        }

        // Background tasks exit on their own once the cache is gone
        let mut reopened = None;
        for _ in 0..50 {
            match DiskCache::open(options(dir.path())) {
                Ok(cache) => {
                    reopened = Some(cache);
                    break;
                }
                Err(Error::ConfigurationConflict(_)) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("unexpected open error: {e}"),
            }
        }
        let cache = reopened.expect("directory lock was never released");
        cache.start().await.unwrap();
        assert!(cache.store().contains_indexed(&CacheKey::new("/pending")));
        cache.stop().await;
    }
}
