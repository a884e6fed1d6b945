//! Per-key build coordination
//!
//! At most one build runs per key. The first caller to miss registers a
//! completion channel in its shard's in-flight map and spawns the build;
//! every later caller for the same key subscribes to that channel instead of
//! invoking the producer.
//!
//! The build runs as its own task. Callers only wait on it, so a caller that
//! gives up (timeout, cancellation, dropped future) never disturbs the build
//! or the other waiters. The result is handed to the write-behind queue
//! before it is published, and the in-flight entry is removed only after
//! publishing, so a key is always visible either as in flight, as buffered,
//! or as indexed.

use crate::meta_store::MetaStore;
use crate::stats::CacheStats;
use crate::write_queue::WriteBehindQueue;
use parking_lot::Mutex;
use rendercache_common::{CacheKey, CachedBlob, Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error type producers may fail with
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure broadcast to every waiter of a build
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildFailure {
    pub reason: String,
}

type BuildOutcome = std::result::Result<CachedBlob, BuildFailure>;
type InflightMap = HashMap<CacheKey, watch::Receiver<Option<BuildOutcome>>>;

/// Where a response came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseSource {
    Disk,
    /// Write-behind buffer, not yet flushed
    Buffered,
    /// This caller's own build
    Built,
    /// A build started by another caller
    Coalesced,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheResponse {
    pub blob: CachedBlob,
    pub source: ResponseSource,
}

/// Build state of a key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    Building,
}

/// Lookups that keep finding a just-indexed entry unreadable give up and build
const MAX_LOOKUP_ROUNDS: usize = 3;

/// Removes the in-flight entry when the build task ends, panics included
struct InflightGuard {
    map: Arc<Mutex<InflightMap>>,
    key: CacheKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map.lock().remove(&self.key);
    }
}

enum Claim {
    Hit(CacheResponse),
    Recheck,
    Wait(watch::Receiver<Option<BuildOutcome>>, ResponseSource),
}

pub struct BuildCoordinator {
    store: Arc<MetaStore>,
    queue: Arc<WriteBehindQueue>,
    inflight: Vec<Arc<Mutex<InflightMap>>>,
    stats: Arc<CacheStats>,
}

impl BuildCoordinator {
    pub fn new(store: Arc<MetaStore>, queue: Arc<WriteBehindQueue>, stats: Arc<CacheStats>) -> Self {
        let inflight = (0..store.shards().len())
            .map(|_| Arc::new(Mutex::new(HashMap::new())))
            .collect();
        Self {
            store,
            queue,
            inflight,
            stats,
        }
    }

    fn inflight_for(&self, key: &CacheKey) -> &Arc<Mutex<InflightMap>> {
        &self.inflight[self.store.resolve(key) as usize]
    }

    /// Current build state of a key
    #[must_use]
    pub fn state(&self, key: &CacheKey) -> BuildState {
        if self.inflight_for(key).lock().contains_key(key) {
            BuildState::Building
        } else {
            BuildState::Idle
        }
    }

    /// Number of builds in flight across all shards
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.iter().map(|m| m.lock().len()).sum()
    }

    /// Return the cached blob for `key`, building it at most once if missing
    ///
    /// Cancelling `cancel` stops this caller's wait; the build continues for
    /// the other waiters and still populates the cache.
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
        if self.queue.is_stopping() {
            return Err(Error::ShuttingDown);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(key.to_string()));
        }

        let mut producer = Some(producer);
        let mut rounds = 0;
        let (mut rx, source) = loop {
            rounds += 1;
            if let Some(hit) = self.cached(&key).await {
                return Ok(hit);
            }
            match self.claim(&key, &mut producer, rounds >= MAX_LOOKUP_ROUNDS) {
                Claim::Hit(hit) => return Ok(hit),
                Claim::Recheck => continue,
                Claim::Wait(rx, source) => break (rx, source),
            }
        };

        let outcome = tokio::select! {
            biased;
            published = async { rx.wait_for(Option::is_some).await.map(|v| v.clone()) } => published,
            () = cancel.cancelled() => {
                debug!("Stopped waiting for {}: cancelled", key);
                return Err(Error::Cancelled(key.to_string()));
            }
        };

        match outcome {
            Ok(Some(Ok(blob))) => Ok(CacheResponse { blob, source }),
            Ok(Some(Err(failure))) => Err(Error::BuildFailed {
                key: key.to_string(),
                reason: failure.reason,
            }),
            Ok(None) | Err(_) => Err(Error::BuildFailed {
                key: key.to_string(),
                reason: "build aborted before publishing a result".into(),
            }),
        }
    }

    /// Like [`get_or_create`](Self::get_or_create), giving up after `timeout`
    pub async fn get_or_create_within<F, Fut>(
        &self,
        key: CacheKey,
        producer: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CacheResponse>
    where
        F: FnOnce(CacheKey) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<CachedBlob, ProducerError>> + Send + 'static,
    {
        let name = key.to_string();
        tokio::time::timeout(timeout, self.get_or_create(key, producer, cancel))
            .await
            .unwrap_or(Err(Error::Timeout(name)))
    }

    /// Buffered or on-disk copy of a key; read errors count as misses
    async fn cached(&self, key: &CacheKey) -> Option<CacheResponse> {
        if let Some(blob) = self.queue.get(key) {
            CacheStats::incr(&self.stats.buffered_hits);
            return Some(CacheResponse {
                blob,
                source: ResponseSource::Buffered,
            });
        }

        let store = Arc::clone(&self.store);
        let lookup_key = key.clone();
        match tokio::task::spawn_blocking(move || store.read_blob(&lookup_key)).await {
            Ok(Ok(Some(blob))) => {
                CacheStats::incr(&self.stats.hits);
                Some(CacheResponse {
                    blob,
                    source: ResponseSource::Disk,
                })
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!("Cache read for {} failed, treating as miss: {}", key, e);
                None
            }
            Err(e) => {
                warn!("Cache read task for {} failed: {}", key, e);
                None
            }
        }
    }

    /// Join an in-flight build or start one, under the shard's in-flight lock
    fn claim<F, Fut>(&self, key: &CacheKey, producer: &mut Option<F>, force_build: bool) -> Claim
    where
        F: FnOnce(CacheKey) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<CachedBlob, ProducerError>> + Send + 'static,
    {
        let map = self.inflight_for(key);
        let mut inflight = map.lock();

        if let Some(rx) = inflight.get(key) {
            CacheStats::incr(&self.stats.coalesced);
            debug!("Joining in-flight build of {}", key);
            return Claim::Wait(rx.clone(), ResponseSource::Coalesced);
        }

        // A build may have completed between the lookup and taking the lock
        if let Some(blob) = self.queue.get(key) {
            CacheStats::incr(&self.stats.buffered_hits);
            return Claim::Hit(CacheResponse {
                blob,
                source: ResponseSource::Buffered,
            });
        }
        if !force_build && self.store.contains_indexed(key) {
            return Claim::Recheck;
        }

        let Some(producer) = producer.take() else {
            return Claim::Recheck;
        };
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.clone(), rx.clone());
        drop(inflight);

        CacheStats::incr(&self.stats.misses);
        CacheStats::incr(&self.stats.builds);
        debug!("Building {}", key);

        let guard = InflightGuard {
            map: Arc::clone(map),
            key: key.clone(),
        };
        let queue = Arc::clone(&self.queue);
        let stats = Arc::clone(&self.stats);
        let build_key = key.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = match producer(build_key.clone()).await {
                Ok(blob) => {
                    match queue.enqueue(build_key.clone(), blob.clone()).await {
                        Ok(_) => {}
                        Err(e) => warn!("Built {} but could not queue it: {}", build_key, e),
                    }
                    Ok(blob)
                }
                Err(e) => {
                    CacheStats::incr(&stats.build_failures);
                    warn!("Build of {} failed: {}", build_key, e);
                    Err(BuildFailure {
                        reason: e.to_string(),
                    })
                }
            };
            tx.send_replace(Some(outcome));
        });

        Claim::Wait(rx, ResponseSource::Built)
    }
}
