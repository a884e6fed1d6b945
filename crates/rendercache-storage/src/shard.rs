//! One shard of the metadata store
//!
//! A shard owns a slice of the key space: its blob subtree, its folder index
//! and its metadata log. Loading is lazy; the first operation that needs the
//! index replays the log. A log that fails verification is quarantined and
//! rebuilt from a full scan of the blob subtree, so corruption never takes the
//! cache down.
//!
//! Blob file changes and their log records are applied under the shard's log
//! lock, and the log is always written before the index learns about a change.

use crate::blob;
use crate::index::{DriftEvent, DriftKind, DriftListener, FolderIndex, Lookup, StatOutcome};
use crate::issues::IssueSink;
use crate::layout::{self, relative_path_for, BLOB_DIR, LOG_FILE, TMP_DIR};
use crate::meta_log::{LogOp, LogRecord, ShardLog};
use crate::stats::CacheStats;
use parking_lot::Mutex;
use rendercache_common::{now_millis, CacheEntry, CacheKey, CachedBlob, Error, Issue, Result, ShardId};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Logs shorter than this are never compacted
const MIN_COMPACTION_RECORDS: u64 = 64;

/// Per-shard settings
#[derive(Clone, Debug)]
pub struct ShardConfig {
    pub sync_log_writes: bool,
    /// Compact once the log holds this many records per live entry (0 disables)
    pub log_compaction_ratio: u64,
}

/// Point-in-time shard summary
#[derive(Clone, Debug, Serialize)]
pub struct ShardStats {
    pub shard: ShardId,
    pub loaded: bool,
    /// Running without a metadata log
    pub degraded: bool,
    pub entries: usize,
    pub bytes: u64,
    pub folders: usize,
    pub log_records: u64,
    pub log_bytes: u64,
}

/// Outcome of a full shard verification
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    pub shard: ShardId,
    pub indexed_before: usize,
    pub indexed_after: usize,
    pub bytes: u64,
    /// Indexed files that were missing on disk
    pub vanished: usize,
    /// Files changed on disk without going through the cache
    pub modified: usize,
}

pub struct Shard {
    id: ShardId,
    dir: PathBuf,
    tmp_dir: PathBuf,
    index: FolderIndex,
    log: Mutex<Option<ShardLog>>,
    loaded: AtomicBool,
    load_lock: Mutex<()>,
    config: ShardConfig,
    issues: Arc<IssueSink>,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Shard {
    /// Create an unloaded shard rooted at `<cache_root>/shard-NNNN`
    pub fn new(
        cache_root: &Path,
        id: ShardId,
        config: ShardConfig,
        issues: Arc<IssueSink>,
        stats: Arc<CacheStats>,
    ) -> Self {
        let dir = cache_root.join(layout::shard_dir_name(id));
        let drift_stats = Arc::clone(&stats);
        let listener: DriftListener = Arc::new(move |event: &DriftEvent| {
            CacheStats::incr(&drift_stats.drift_events);
            warn!(
                "Shard {} index drift: {} {:?}, folder {:?} cleared",
                id, event.path, event.kind, event.folder
            );
        });

        Self {
            id,
            tmp_dir: dir.join(TMP_DIR),
            index: FolderIndex::new(dir.join(BLOB_DIR), Some(listener)),
            dir,
            log: Mutex::new(None),
            loaded: AtomicBool::new(false),
            load_lock: Mutex::new(()),
            config,
            issues,
            stats,
        }
    }

    #[must_use]
    pub fn id(&self) -> ShardId {
        self.id
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn index(&self) -> &FolderIndex {
        &self.index
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn source(&self) -> String {
        layout::shard_dir_name(self.id)
    }

    /// Load the shard if this has not happened yet
    pub fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let _guard = self.load_lock.lock();
        if self.is_loaded() {
            return Ok(());
        }

        fs::create_dir_all(self.index.root())?;
        fs::create_dir_all(&self.tmp_dir)?;
        self.clear_staging();

        let log_path = self.dir.join(LOG_FILE);
        self.index.reset();
        let mut skipped = 0usize;
        let opened = ShardLog::open(&log_path, self.id, self.config.sync_log_writes, |op| {
            let applied = match op {
                LogOp::Put(record) => self.index.insert(record.into_entry()).map(|_| ()),
                LogOp::Delete { relative_path } => self.index.remove(&relative_path).map(|_| ()),
            };
            if applied.is_err() {
                skipped += 1;
            }
        });
        if skipped > 0 {
            warn!("Shard {} skipped {} malformed log records", self.id, skipped);
        }

        match opened {
            Ok(mut log) => {
                self.maybe_compact(&mut log);
                info!(
                    "Loaded shard {}: {} entries, {} bytes",
                    self.id,
                    self.index.len(),
                    self.index.total_bytes()
                );
                *self.log.lock() = Some(log);
            }
            Err(Error::ShardCorruption { reason, .. }) => {
                self.issues.report(Issue::warning(
                    self.source(),
                    format!("metadata log corrupt ({reason}); rebuilt from disk"),
                ));
                *self.log.lock() = self.rebuild(&log_path);
            }
            Err(e) => {
                self.issues.report(Issue::error(
                    self.source(),
                    format!("metadata log unavailable ({e}); running without persistence"),
                ));
                self.index.reset();
                if let Err(e) = self.index.populate_tree("") {
                    error!("Shard {} scan failed: {}", self.id, e);
                }
            }
        }

        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Quarantine a corrupt log and rebuild index and log from a scan
    fn rebuild(&self, log_path: &Path) -> Option<ShardLog> {
        let quarantine = log_path.with_extension(format!("log.corrupt-{}", now_millis()));
        if let Err(e) = fs::rename(log_path, &quarantine) {
            error!("Shard {} failed to quarantine log: {}", self.id, e);
            return None;
        }
        warn!("Shard {} log moved to {:?}; rescanning", self.id, quarantine);

        self.index.reset();
        let report = match self.index.populate_tree("") {
            Ok(report) => report,
            Err(e) => {
                error!("Shard {} rescan failed: {}", self.id, e);
                return None;
            }
        };

        let mut log = match ShardLog::open(log_path, self.id, self.config.sync_log_writes, |_| {}) {
            Ok(log) => log,
            Err(e) => {
                error!("Shard {} failed to create log: {}", self.id, e);
                return None;
            }
        };
        if let Err(e) = self.rewrite_from_index(&mut log) {
            error!("Shard {} failed to write rebuilt log: {}", self.id, e);
            return None;
        }
        info!(
            "Rebuilt shard {}: {} entries, {} bytes",
            self.id, report.files, report.bytes
        );
        Some(log)
    }

    /// Staging files left by a crash are never renamed into place
    fn clear_staging(&self) {
        let Ok(entries) = fs::read_dir(&self.tmp_dir) else {
            return;
        };
        for entry in entries.flatten() {
            if let Err(e) = fs::remove_file(entry.path()) {
                debug!("Failed to remove stale staging file {:?}: {}", entry.path(), e);
            }
        }
    }

    fn rewrite_from_index(&self, log: &mut ShardLog) -> Result<()> {
        let snapshot = self.index.snapshot();
        log.rewrite(snapshot.iter().map(|e| LogOp::Put(LogRecord::from_entry(e))))
    }

    fn maybe_compact(&self, log: &mut ShardLog) {
        let ratio = self.config.log_compaction_ratio;
        if ratio == 0 {
            return;
        }
        let live = self.index.len() as u64;
        let threshold = live.saturating_mul(ratio).max(MIN_COMPACTION_RECORDS);
        if log.record_count() <= threshold {
            return;
        }
        debug!(
            "Compacting shard {} log: {} records for {} entries",
            self.id,
            log.record_count(),
            live
        );
        if let Err(e) = self.rewrite_from_index(log) {
            warn!("Shard {} log compaction failed: {}", self.id, e);
        }
    }

    /// Index-only check, no filesystem access
    pub fn peek(&self, key: &CacheKey) -> Result<Lookup> {
        self.index.lookup(&relative_path_for(key))
    }

    /// Whether the in-memory index currently holds the key
    #[must_use]
    pub fn contains_indexed(&self, key: &CacheKey) -> bool {
        matches!(self.peek(key), Ok(Lookup::Hit(_)))
    }

    /// Resolve a key's entry, consulting disk when the index cannot answer
    ///
    /// On drift the containing folder is re-listed before answering, so the
    /// result reflects the disk.
    pub fn get_metadata(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.ensure_loaded()?;
        let relative = relative_path_for(key);

        match self.index.lookup_or_stat(&relative)? {
            StatOutcome::Found(entry) => Ok(Some(entry)),
            StatOutcome::Absent => Ok(None),
            StatOutcome::Drifted(event) => self.heal(key, &event),
        }
    }

    fn heal(&self, key: &CacheKey, event: &DriftEvent) -> Result<Option<CacheEntry>> {
        let mut log = self.log.lock();
        self.index
            .populate(&event.folder)
            .map_err(|e| Error::IndexDrift {
                path: event.path.clone(),
                reason: format!("re-scan of {:?} failed: {e}", event.folder),
            })?;

        match self.index.lookup(&event.path)? {
            Lookup::Hit(mut entry) => {
                entry.key = Some(key.clone());
                self.record_locked(&mut log, entry.clone())?;
                Ok(Some(entry))
            }
            Lookup::Absent | Lookup::Unknown => {
                if event.kind == DriftKind::Disappeared {
                    if let Some(log) = log.as_mut() {
                        log.append(&LogOp::Delete {
                            relative_path: event.path.clone(),
                        })?;
                    }
                }
                Ok(None)
            }
        }
    }

    /// Read a cached blob, bumping its access time
    ///
    /// Missing and corrupt files are misses; a corrupt file is removed.
    pub fn read_blob(&self, key: &CacheKey) -> Result<Option<CachedBlob>> {
        let Some(entry) = self.get_metadata(key)? else {
            return Ok(None);
        };
        let path = self.index.physical_path(&entry.relative_path)?;

        match blob::read(&path) {
            Ok(blob) => {
                self.index.bump_access(&entry.relative_path);
                Ok(Some(blob))
            }
            Err(e) if e.is_not_found() => {
                self.index.report_missing(&entry.relative_path)?;
                Ok(None)
            }
            Err(Error::BlobCorrupt(reason)) => {
                warn!("Shard {} discarding corrupt blob {:?}: {}", self.id, path, reason);
                self.discard(&entry.relative_path)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn discard(&self, relative_path: &str) -> Result<()> {
        let mut log = self.log.lock();
        self.index.remove(relative_path)?;
        let path = self.index.physical_path(relative_path)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(log) = log.as_mut() {
            log.append(&LogOp::Delete {
                relative_path: relative_path.to_string(),
            })?;
        }
        Ok(())
    }

    /// Persist a blob and record it
    pub fn write_blob(&self, key: &CacheKey, blob: &CachedBlob) -> Result<CacheEntry> {
        self.ensure_loaded()?;
        let relative = relative_path_for(key);
        let target = self.index.physical_path(&relative)?;

        let mut log = self.log.lock();
        blob::write_atomic(&self.tmp_dir, &target, blob)?;
        let entry = crate::index::entry_for_written_file(&relative, &target, key.clone())?;
        self.record_locked(&mut log, entry.clone())?;
        Ok(entry)
    }

    fn record_locked(&self, log: &mut Option<ShardLog>, entry: CacheEntry) -> Result<()> {
        if let Some(log) = log.as_mut() {
            log.append(&LogOp::Put(LogRecord::from_entry(&entry)))?;
        }
        self.index.insert(entry)?;
        if let Some(log) = log.as_mut() {
            self.maybe_compact(log);
        }
        Ok(())
    }

    /// Delete an entry unless it was accessed after `accessed_ms`
    ///
    /// Returns the number of bytes freed, or `None` if the entry is gone or
    /// was touched since the caller looked at it.
    pub fn evict(&self, relative_path: &str, accessed_ms: u64) -> Result<Option<u64>> {
        let mut log = self.log.lock();
        let Some(entry) = self.index.remove_if_idle_since(relative_path, accessed_ms)? else {
            return Ok(None);
        };

        let path = self.index.physical_path(relative_path)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Evicted entry {} was already gone", relative_path);
            }
            Err(e) => {
                self.index.insert(entry)?;
                return Err(e.into());
            }
        }

        if let Some(log) = log.as_mut() {
            if let Err(e) = log.append(&LogOp::Delete {
                relative_path: relative_path.to_string(),
            }) {
                warn!("Shard {} failed to log eviction of {}: {}", self.id, relative_path, e);
            }
        }
        Ok(Some(entry.size_bytes))
    }

    /// Re-list the whole blob subtree and rewrite the log to match
    pub fn verify(&self) -> Result<VerifyReport> {
        self.ensure_loaded()?;
        let mut log = self.log.lock();
        let indexed_before = self.index.len();
        let report = self.index.populate_tree("")?;
        if let Some(log) = log.as_mut() {
            self.rewrite_from_index(log)?;
        }
        Ok(VerifyReport {
            shard: self.id,
            indexed_before,
            indexed_after: self.index.len(),
            bytes: self.index.total_bytes(),
            vanished: report.vanished,
            modified: report.modified,
        })
    }

    /// Rewrite the log so it holds one record per live entry
    pub fn compact(&self) -> Result<()> {
        self.ensure_loaded()?;
        let mut log = self.log.lock();
        match log.as_mut() {
            Some(log) => self.rewrite_from_index(log),
            None => Ok(()),
        }
    }

    pub fn sync(&self) -> Result<()> {
        match self.log.lock().as_mut() {
            Some(log) => log.sync(),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.total_bytes()
    }

    pub fn stats(&self) -> ShardStats {
        let log = self.log.lock();
        ShardStats {
            shard: self.id,
            loaded: self.is_loaded(),
            degraded: self.is_loaded() && log.is_none(),
            entries: self.index.len(),
            bytes: self.index.total_bytes(),
            folders: self.index.folder_count(),
            log_records: log.as_ref().map_or(0, ShardLog::record_count),
            log_bytes: log.as_ref().map_or(0, ShardLog::size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shard(root: &Path) -> Shard {
        Shard::new(
            root,
            0,
            ShardConfig {
                sync_log_writes: false,
                log_compaction_ratio: 4,
            },
            Arc::new(IssueSink::new()),
            Arc::new(CacheStats::default()),
        )
    }

    fn png(n: u8) -> CachedBlob {
        CachedBlob::new(vec![n; 100], "image/png")
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let shard = shard(dir.path());
        let key = CacheKey::new("/a.png?w=10");

        assert!(shard.read_blob(&key).unwrap().is_none());
        let entry = shard.write_blob(&key, &png(1)).unwrap();
        assert_eq!(entry.key.as_ref(), Some(&key));
        assert!(shard.contains_indexed(&key));
        assert_eq!(shard.read_blob(&key).unwrap(), Some(png(1)));
        assert_eq!(shard.total_bytes(), entry.size_bytes);
    }

    #[test]
    fn test_reload_replays_log() {
        let dir = tempdir().unwrap();
        let keys: Vec<CacheKey> = (0..10).map(|n| CacheKey::new(format!("/k{n}"))).collect();
        let total = {
            let shard = shard(dir.path());
            for (n, key) in keys.iter().enumerate() {
                shard.write_blob(key, &png(n as u8)).unwrap();
            }
            let relative = relative_path_for(&keys[0]);
            let accessed = shard.get_metadata(&keys[0]).unwrap().unwrap().accessed_ms;
            assert!(shard.evict(&relative, accessed).unwrap().is_some());
            shard.sync().unwrap();
            shard.total_bytes()
        };

        let reopened = shard(dir.path());
        reopened.ensure_loaded().unwrap();
        assert_eq!(reopened.index().len(), 9);
        assert_eq!(reopened.total_bytes(), total);
        assert!(!reopened.contains_indexed(&keys[0]));
        assert_eq!(reopened.read_blob(&keys[5]).unwrap(), Some(png(5)));
    }

    #[test]
    fn test_corrupt_log_rebuilt_from_disk() {
        let dir = tempdir().unwrap();
        let key = CacheKey::new("/survivor");
        {
            let shard = shard(dir.path());
            shard.write_blob(&key, &png(9)).unwrap();
            shard.sync().unwrap();
        }
        let log_path = dir.path().join("shard-0000").join(LOG_FILE);
        fs::write(&log_path, b"definitely not a log record, long enough to parse").unwrap();

        let shard = shard(dir.path());
        shard.ensure_loaded().unwrap();
        assert_eq!(shard.index().len(), 1);
        assert!(!shard.issues.is_empty());
        assert!(!shard.stats().degraded);
        assert_eq!(shard.read_blob(&key).unwrap(), Some(png(9)));

        let quarantined = fs::read_dir(dir.path().join("shard-0000"))
            .unwrap()
            .flatten()
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(quarantined);
    }

    #[test]
    fn test_vanished_blob_is_a_miss() {
        let dir = tempdir().unwrap();
        let shard = shard(dir.path());
        let key = CacheKey::new("/gone");
        shard.write_blob(&key, &png(2)).unwrap();

        let path = shard.index().physical_path(&relative_path_for(&key)).unwrap();
        fs::remove_file(path).unwrap();

        assert!(shard.read_blob(&key).unwrap().is_none());
        assert!(!shard.contains_indexed(&key));
        assert_eq!(shard.stats.drift_events.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_corrupt_blob_discarded() {
        let dir = tempdir().unwrap();
        let shard = shard(dir.path());
        let key = CacheKey::new("/flipped");
        shard.write_blob(&key, &png(3)).unwrap();
        let entry = shard.get_metadata(&key).unwrap().unwrap();
        let path = shard.index().physical_path(&entry.relative_path).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, data).unwrap();

        assert!(shard.read_blob(&key).unwrap().is_none());
        assert!(!path.exists());
        assert!(shard.get_metadata(&key).unwrap().is_none());
    }

    #[test]
    fn test_evict_skips_recently_accessed() {
        let dir = tempdir().unwrap();
        let shard = shard(dir.path());
        let key = CacheKey::new("/hot");
        let entry = shard.write_blob(&key, &png(4)).unwrap();

        shard.index().bump_access_at(&entry.relative_path, entry.accessed_ms + 1000);
        assert_eq!(shard.evict(&entry.relative_path, entry.accessed_ms).unwrap(), None);
        assert!(shard.contains_indexed(&key));
    }

    #[test]
    fn test_verify_finds_external_files() {
        let dir = tempdir().unwrap();
        let shard = shard(dir.path());
        shard.write_blob(&CacheKey::new("/a"), &png(1)).unwrap();

        let stray = shard.index().root().join("ff/ee/stray.blob");
        fs::create_dir_all(stray.parent().unwrap()).unwrap();
        fs::write(&stray, b"xyz").unwrap();

        let report = shard.verify().unwrap();
        assert_eq!(report.indexed_before, 1);
        assert_eq!(report.indexed_after, 2);
        assert_eq!(shard.stats().log_records, 2);
    }

    #[test]
    fn test_log_compaction() {
        let dir = tempdir().unwrap();
        let shard = shard(dir.path());
        let key = CacheKey::new("/rewritten");
        for n in 0..(MIN_COMPACTION_RECORDS as u8 + 10) {
            shard.write_blob(&key, &png(n)).unwrap();
        }
        assert!(shard.stats().log_records <= MIN_COMPACTION_RECORDS);
        assert_eq!(shard.index().len(), 1);
    }
}
