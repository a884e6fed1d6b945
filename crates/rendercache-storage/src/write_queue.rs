//! Write-behind queue
//!
//! Freshly built blobs are buffered in memory and persisted by a background
//! worker. The buffer is bounded by a byte budget: an enqueue that would
//! exceed it is written inline instead, which throttles producers to disk
//! speed under bursts.
//!
//! A queued key stays readable from the buffer until the worker has both
//! written its file and recorded it in the shard, so there is no window in
//! which a completed build looks like a miss.

use crate::issues::IssueSink;
use crate::meta_store::MetaStore;
use crate::stats::CacheStats;
use parking_lot::Mutex;
use rendercache_common::{CacheEntry, CacheKey, CacheOptions, CachedBlob, Error, Issue, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a queued write did not reach disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteError {
    pub attempts: u32,
    pub reason: String,
}

type WriteOutcome = std::result::Result<(), WriteError>;

struct PendingWrite {
    blob: CachedBlob,
    generation: u64,
    enqueued_at: Instant,
    waiters: Vec<oneshot::Sender<WriteOutcome>>,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<CacheKey, PendingWrite>,
    /// Flush order; entries whose generation no longer matches are stale
    order: VecDeque<(CacheKey, u64)>,
    queued_bytes: u64,
    next_generation: u64,
}

impl QueueState {
    /// Oldest live pending write, dropping stale order entries on the way
    fn front(&mut self) -> Option<(CacheKey, u64, CachedBlob, Instant)> {
        loop {
            let (key, generation) = self.order.front()?.clone();
            match self.pending.get(&key) {
                Some(p) if p.generation == generation => {
                    return Some((key, generation, p.blob.clone(), p.enqueued_at));
                }
                _ => {
                    self.order.pop_front();
                }
            }
        }
    }

    /// Remove a pending write if it is still the given generation
    fn complete(&mut self, key: &CacheKey, generation: u64) -> Option<PendingWrite> {
        if self.pending.get(key)?.generation != generation {
            return None;
        }
        let done = self.pending.remove(key)?;
        self.queued_bytes -= done.blob.len() as u64;
        Some(done)
    }
}

/// Completion handle returned by [`WriteBehindQueue::enqueue`]
#[derive(Debug)]
pub struct WriteTicket {
    key: CacheKey,
    state: TicketState,
}

#[derive(Debug)]
enum TicketState {
    Done(WriteOutcome),
    Pending(oneshot::Receiver<WriteOutcome>),
}

impl WriteTicket {
    /// Whether the write was buffered rather than performed inline
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(self.state, TicketState::Pending(_))
    }

    /// Wait until the blob is on disk and recorded
    pub async fn written(self) -> Result<()> {
        let outcome = match self.state {
            TicketState::Done(outcome) => outcome,
            TicketState::Pending(rx) => rx.await.unwrap_or_else(|_| {
                Err(WriteError {
                    attempts: 0,
                    reason: "write abandoned".into(),
                })
            }),
        };
        outcome.map_err(|e| Error::WriteFailure {
            key: self.key.to_string(),
            attempts: e.attempts,
            reason: e.reason,
        })
    }
}

/// Result of draining the queue at shutdown
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StopReport {
    pub drained: bool,
    /// Writes discarded because the drain timed out
    pub abandoned: usize,
}

struct QueueInner {
    store: Arc<MetaStore>,
    state: Mutex<QueueState>,
    max_bytes: u64,
    retry_limit: u32,
    retry_backoff: Duration,
    wake: Notify,
    stopping: AtomicBool,
    stats: Arc<CacheStats>,
    issues: Arc<IssueSink>,
}

pub struct WriteBehindQueue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBehindQueue {
    pub fn new(
        store: Arc<MetaStore>,
        options: &CacheOptions,
        stats: Arc<CacheStats>,
        issues: Arc<IssueSink>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                state: Mutex::new(QueueState::default()),
                max_bytes: options.write_queue_bytes(),
                retry_limit: options.flush_retry_limit.max(1),
                retry_backoff: options.flush_retry_backoff(),
                wake: Notify::new(),
                stopping: AtomicBool::new(false),
                stats,
                issues,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background flush worker; no-op if already running
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(async move {
            flush_worker(inner).await;
        }));
        debug!("Write-behind worker started");
    }

    /// Queue a blob for persistence
    ///
    /// Buffers the blob if it fits the memory budget, otherwise writes it
    /// before returning. Fails only when the queue is shutting down; write
    /// failures are reported through the ticket.
    pub async fn enqueue(&self, key: CacheKey, blob: CachedBlob) -> Result<WriteTicket> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let len = blob.len() as u64;
        let buffered = {
            let mut state = self.inner.state.lock();
            let replaced = state.pending.get(&key).map_or(0, |p| p.blob.len() as u64);
            if state.queued_bytes - replaced + len <= self.inner.max_bytes {
                let generation = state.next_generation;
                state.next_generation += 1;
                let (tx, rx) = oneshot::channel();
                let mut waiters = state
                    .pending
                    .remove(&key)
                    .map(|p| p.waiters)
                    .unwrap_or_default();
                waiters.push(tx);
                state.queued_bytes = state.queued_bytes - replaced + len;
                state.pending.insert(
                    key.clone(),
                    PendingWrite {
                        blob: blob.clone(),
                        generation,
                        enqueued_at: Instant::now(),
                        waiters,
                    },
                );
                state.order.push_back((key.clone(), generation));
                Some(rx)
            } else {
                None
            }
        };

        if let Some(rx) = buffered {
            self.inner.wake.notify_one();
            debug!("Queued {} ({} bytes)", key, len);
            return Ok(WriteTicket {
                key,
                state: TicketState::Pending(rx),
            });
        }

        // Over budget: write on the caller's path
        CacheStats::incr(&self.inner.stats.sync_writes);
        debug!("Write queue full, writing {} inline", key);
        let outcome = persist(&self.inner, &key, &blob).await.map(|_| ());
        if let Err(e) = &outcome {
            self.inner.report_dropped(&key, e);
        }
        Ok(WriteTicket {
            key,
            state: TicketState::Done(outcome),
        })
    }

    /// Buffered blob for a key that has not reached disk yet
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CachedBlob> {
        self.inner
            .state
            .lock()
            .pending
            .get(key)
            .map(|p| p.blob.clone())
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }

    /// Bytes currently held in memory
    #[must_use]
    pub fn queued_bytes(&self) -> u64 {
        self.inner.state.lock().queued_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Flush everything currently queued on the calling task
    pub async fn flush(&self) {
        while flush_next(&self.inner).await {}
    }

    /// Reject new writes and let the worker exit once the buffer is empty
    pub fn close(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// Stop accepting writes and drain the buffer
    ///
    /// Writes still queued after `timeout` are abandoned with a warning.
    pub async fn stop(&self, timeout: Duration) -> StopReport {
        self.close();

        let handle = self.worker.lock().take();
        let drained = match handle {
            Some(handle) => {
                let abort = handle.abort_handle();
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        error!("Write-behind worker failed: {}", e);
                        false
                    }
                    Err(_) => {
                        abort.abort();
                        false
                    }
                }
            }
            None => tokio::time::timeout(timeout, self.flush()).await.is_ok(),
        };

        let abandoned = self.inner.abandon_all();
        if abandoned > 0 {
            warn!(
                "Write-behind queue stopped with {} unflushed writes abandoned",
                abandoned
            );
        } else {
            info!("Write-behind queue drained");
        }
        StopReport {
            drained: drained && abandoned == 0,
            abandoned,
        }
    }
}

impl QueueInner {
    fn report_dropped(&self, key: &CacheKey, e: &WriteError) {
        CacheStats::incr(&self.stats.dropped);
        error!(
            "Dropping write of {} after {} attempts: {}",
            key, e.attempts, e.reason
        );
        self.issues.report(Issue::error(
            "write_queue",
            format!("writes are failing: {}", e.reason),
        ));
    }

    fn abandon_all(&self) -> usize {
        let mut state = self.state.lock();
        let abandoned = state.pending.len();
        for (_, pending) in state.pending.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(WriteError {
                    attempts: 0,
                    reason: "abandoned at shutdown".into(),
                }));
            }
        }
        state.order.clear();
        state.queued_bytes = 0;
        for _ in 0..abandoned {
            CacheStats::incr(&self.stats.dropped);
        }
        abandoned
    }
}

/// Write one blob through the store, retrying I/O failures with linear backoff
async fn persist(
    inner: &QueueInner,
    key: &CacheKey,
    blob: &CachedBlob,
) -> std::result::Result<CacheEntry, WriteError> {
    let mut last_error = String::new();
    for attempt in 1..=inner.retry_limit {
        let store = Arc::clone(&inner.store);
        let task_key = key.clone();
        let task_blob = blob.clone();
        let result =
            tokio::task::spawn_blocking(move || store.write_blob(&task_key, &task_blob)).await;

        match result {
            Ok(Ok(entry)) => return Ok(entry),
            Ok(Err(e)) if !e.is_retryable() => {
                return Err(WriteError {
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(e) => last_error = format!("write task failed: {e}"),
        }
        if attempt < inner.retry_limit {
            warn!(
                "Write of {} failed (attempt {}/{}): {}",
                key, attempt, inner.retry_limit, last_error
            );
            tokio::time::sleep(inner.retry_backoff * attempt).await;
        }
    }
    Err(WriteError {
        attempts: inner.retry_limit,
        reason: last_error,
    })
}

/// Persist the oldest queued write; returns false when the queue is empty
async fn flush_next(inner: &QueueInner) -> bool {
    let Some((key, generation, blob, enqueued_at)) = inner.state.lock().front() else {
        return false;
    };

    let outcome = persist(inner, &key, &blob).await;
    let done = inner.state.lock().complete(&key, generation);
    let Some(done) = done else {
        // Replaced while writing; the newer generation is flushed next
        return true;
    };

    let outcome = match outcome {
        Ok(_) => {
            CacheStats::incr(&inner.stats.flushed);
            debug!(
                "Flushed {} ({} bytes, queued {:?})",
                key,
                blob.len(),
                enqueued_at.elapsed()
            );
            Ok(())
        }
        Err(e) => {
            inner.report_dropped(&key, &e);
            Err(e)
        }
    };
    for waiter in done.waiters {
        let _ = waiter.send(outcome.clone());
    }
    true
}

async fn flush_worker(inner: Arc<QueueInner>) {
    loop {
        if flush_next(&inner).await {
            continue;
        }
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }
        inner.wake.notified().await;
    }
    debug!("Write-behind worker exiting");
}
