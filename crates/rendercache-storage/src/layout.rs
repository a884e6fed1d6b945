//! On-disk layout of a cache directory
//!
//! ```text
//! <cache_location>/
//!   layout.json            format version + shard count
//!   .rendercache.lock      exclusive advisory lock held by the owning instance
//!   shard-0000/
//!     meta.log             append-only metadata log
//!     blobs/ab/cd/<sha256>.blob
//!     tmp/                 staging area for atomic blob writes
//!   shard-0001/ ...
//! ```
//!
//! Shard assignment is `xxh64(key) % shards` with a fixed seed, so it is
//! stable across restarts. Changing the shard count invalidates the layout.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use rendercache_common::{now_millis, CacheKey, Error, Result, ShardId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Layout manifest file name
pub const LAYOUT_FILE: &str = "layout.json";

/// Instance lock file name
pub const LOCK_FILE: &str = ".rendercache.lock";

/// Shard metadata log file name
pub const LOG_FILE: &str = "meta.log";

/// Blob subtree under each shard directory
pub const BLOB_DIR: &str = "blobs";

/// Staging directory under each shard directory
pub const TMP_DIR: &str = "tmp";

/// Current layout format version
pub const FORMAT_VERSION: u32 = 1;

/// Seed for shard routing; must never change
const SHARD_HASH_SEED: u64 = 0;

/// Contents of `layout.json`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutManifest {
    pub format_version: u32,
    pub shards: u32,
    /// Creation timestamp (unix millis)
    pub created_ms: u64,
}

/// Route a key to its shard
#[must_use]
pub fn shard_for(key: &CacheKey, shards: u32) -> ShardId {
    let hash = xxhash_rust::xxh64::xxh64(key.as_bytes(), SHARD_HASH_SEED);
    (hash % u64::from(shards.max(1))) as ShardId
}

/// Relative blob path for a key: `ab/cd/<hex sha256>.blob`
#[must_use]
pub fn relative_path_for(key: &CacheKey) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{}/{}/{}.blob", &digest[0..2], &digest[2..4], digest)
}

/// Directory name of a shard
#[must_use]
pub fn shard_dir_name(shard: ShardId) -> String {
    format!("shard-{shard:04}")
}

/// Split a relative file path into segments, rejecting malformed input
///
/// Paths are `/`-separated, never start or end with a separator, and contain
/// no empty, `.` or `..` segments.
pub fn split_relative(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }
    split_folder(path)
}

/// Split a relative folder path; the empty string is the root folder
pub fn split_folder(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if path.starts_with('/') || path.ends_with('/') || path.contains('\\') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments
        .iter()
        .any(|s| s.is_empty() || *s == "." || *s == "..")
    {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

/// Parent folder of a relative file path (`""` for files in the root)
#[must_use]
pub fn parent_folder(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

/// Join validated segments onto a physical root
#[must_use]
pub fn physical_path(root: &Path, segments: &[&str]) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in segments {
        path.push(segment);
    }
    path
}

/// Create or validate the layout manifest of a cache directory
///
/// A directory that already holds entries but has no manifest was written by
/// the legacy single-shard layout and is rejected rather than reinterpreted.
pub fn prepare(root: &Path, shards: u32) -> Result<LayoutManifest> {
    fs::create_dir_all(root)?;
    let manifest_path = root.join(LAYOUT_FILE);

    if manifest_path.exists() {
        let raw = fs::read_to_string(&manifest_path)?;
        let manifest: LayoutManifest = serde_json::from_str(&raw).map_err(|e| {
            Error::configuration(format!(
                "unreadable layout manifest {}: {e}",
                manifest_path.display()
            ))
        })?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(Error::configuration(format!(
                "unsupported layout format version {} at {} (expected {FORMAT_VERSION})",
                manifest.format_version,
                root.display()
            )));
        }
        if manifest.shards != shards {
            return Err(Error::ShardCountMismatch {
                path: root.to_path_buf(),
                on_disk: manifest.shards,
                configured: shards,
            });
        }
        debug!("Layout manifest ok at {:?} ({} shards)", root, shards);
        return Ok(manifest);
    }

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name() != LOCK_FILE {
            return Err(Error::LegacyLayout {
                path: root.to_path_buf(),
            });
        }
    }

    let manifest = LayoutManifest {
        format_version: FORMAT_VERSION,
        shards,
        created_ms: now_millis(),
    };
    let json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let staging = root.join(format!("{LAYOUT_FILE}.new"));
    fs::write(&staging, json)?;
    fs::rename(&staging, &manifest_path)?;

    info!("Initialised cache layout at {:?} with {} shards", root, shards);
    Ok(manifest)
}

/// Exclusive ownership of a cache directory
///
/// Held for the lifetime of the owning cache; the lock is released when the
/// file descriptor closes, including on crash.
pub struct DirectoryLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl DirectoryLock {
    /// Path of the lock file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for DirectoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryLock").field("path", &self.path).finish()
    }
}

/// Acquire the instance lock, failing if another instance owns the directory
pub fn acquire_lock(root: &Path) -> Result<DirectoryLock> {
    fs::create_dir_all(root)?;
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)?;

    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, Errno::EWOULDBLOCK)) => {
            let owner = fs::read_to_string(&path).unwrap_or_default();
            return Err(Error::ConfigurationConflict(format!(
                "cache directory {} is already owned by another cache instance ({})",
                root.display(),
                owner.trim()
            )));
        }
        Err((_, errno)) => {
            return Err(Error::storage(format!(
                "failed to lock {}: {errno}",
                path.display()
            )));
        }
    };

    let mut handle: &File = &lock;
    handle.set_len(0)?;
    writeln!(handle, "pid={}", std::process::id())?;

    Ok(DirectoryLock { _lock: lock, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_shard_routing_is_stable() {
        let key = CacheKey::new("/images/cat.jpg?w=200");
        let first = shard_for(&key, 4);
        for _ in 0..1000 {
            assert_eq!(shard_for(&key, 4), first);
        }
        // Pinned value: routing must survive restarts and upgrades
        assert_eq!(
            shard_for(&key, 4),
            (xxhash_rust::xxh64::xxh64(key.as_bytes(), 0) % 4) as u32
        );
    }

    #[test]
    fn test_relative_path_shape() {
        let path = relative_path_for(&CacheKey::new("k"));
        let segments = split_relative(&path).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), 2);
        assert!(segments[2].starts_with(segments[0]));
        assert!(segments[2].ends_with(".blob"));
    }

    #[test]
    fn test_malformed_paths_rejected() {
        for bad in ["", "/a", "a/", "a//b", "a/./b", "../a", "a\\b"] {
            assert!(split_relative(bad).is_err(), "accepted {bad:?}");
        }
        assert!(split_folder("").unwrap().is_empty());
        assert_eq!(parent_folder("ab/cd/x.blob"), "ab/cd");
        assert_eq!(parent_folder("x.blob"), "");
    }

    #[test]
    fn test_prepare_creates_and_validates_manifest() {
        let dir = tempdir().unwrap();
        let created = prepare(dir.path(), 8).unwrap();
        assert_eq!(created.shards, 8);

        let reopened = prepare(dir.path(), 8).unwrap();
        assert_eq!(reopened, created);

        let err = prepare(dir.path(), 4).unwrap_err();
        assert!(matches!(
            err,
            Error::ShardCountMismatch {
                on_disk: 8,
                configured: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_legacy_layout_rejected() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("3f")).unwrap();
        fs::write(dir.path().join("3f/3fa9.jpg"), b"old").unwrap();

        let err = prepare(dir.path(), 8).unwrap_err();
        assert!(matches!(err, Error::LegacyLayout { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_second_lock_conflicts() {
        let dir = tempdir().unwrap();
        let first = acquire_lock(dir.path()).unwrap();
        let err = acquire_lock(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));

        drop(first);
        assert!(acquire_lock(dir.path()).is_ok());
    }
}
