//! Shard metadata log
//!
//! Append-only record of every write and delete applied to a shard's index.
//! Replaying it on open rebuilds the index without listing the blob tree.
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```
//! `Data` is a bincode-encoded [`LogOp`]. A record cut short at the end of the
//! file is a torn write from a crash and is truncated away. Any other damage
//! makes the whole log untrustworthy and is reported as shard corruption.

use rendercache_common::{CacheEntry, CacheKey, Error, Result, ShardId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Log record magic number
const LOG_MAGIC: u32 = 0x5243_4D4C; // "RCML"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// Records larger than this are treated as corruption rather than allocated
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Persisted part of a cache entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Absent for files discovered by a directory scan
    pub key: Option<String>,
    pub relative_path: String,
    pub size_bytes: u64,
    pub created_ms: u64,
    pub modified_ms: u64,
}

impl LogRecord {
    /// Capture an indexed entry
    #[must_use]
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.as_ref().map(|k| k.as_str().to_string()),
            relative_path: entry.relative_path.clone(),
            size_bytes: entry.size_bytes,
            created_ms: entry.created_ms,
            modified_ms: entry.modified_ms,
        }
    }

    /// Restore an index entry; the access time starts at the write time
    #[must_use]
    pub fn into_entry(self) -> CacheEntry {
        CacheEntry {
            key: self.key.map(CacheKey::new),
            relative_path: self.relative_path,
            size_bytes: self.size_bytes,
            created_ms: self.created_ms,
            modified_ms: self.modified_ms,
            accessed_ms: self.modified_ms,
        }
    }
}

/// One logged operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Put(LogRecord),
    Delete { relative_path: String },
}

fn encode_record(lsn: u64, op: &LogOp) -> Result<Vec<u8>> {
    let data = bincode::serialize(op).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + 4);
    buf.extend_from_slice(&LOG_MAGIC.to_le_bytes());
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&data);

    // CRC over everything except the CRC itself
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

enum Parsed {
    Record { lsn: u64, op: LogOp, size: usize },
    /// Not enough bytes left for a complete record
    Torn,
    Corrupt(String),
}

/// Copy a slice whose length the caller already checked
fn array<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[..N]);
    out
}

fn parse_record(data: &[u8]) -> Parsed {
    if data.len() < RECORD_HEADER_SIZE + 4 {
        return Parsed::Torn;
    }
    let magic = u32::from_le_bytes(array(&data[0..4]));
    if magic != LOG_MAGIC {
        return Parsed::Corrupt("invalid record magic".into());
    }
    let lsn = u64::from_le_bytes(array(&data[4..12]));
    let data_len = u32::from_le_bytes(array(&data[12..16])) as usize;
    if data_len > MAX_RECORD_SIZE {
        return Parsed::Corrupt(format!("record length {data_len} exceeds limit"));
    }

    let total_size = RECORD_HEADER_SIZE + data_len + 4;
    if data.len() < total_size {
        return Parsed::Torn;
    }
    let body_end = RECORD_HEADER_SIZE + data_len;
    let stored_crc = u32::from_le_bytes(array(&data[body_end..total_size]));
    if crc32c::crc32c(&data[..body_end]) != stored_crc {
        return Parsed::Corrupt(format!("CRC mismatch at LSN {lsn}"));
    }

    match bincode::deserialize(&data[RECORD_HEADER_SIZE..body_end]) {
        Ok(op) => Parsed::Record {
            lsn,
            op,
            size: total_size,
        },
        Err(e) => Parsed::Corrupt(format!("undecodable record at LSN {lsn}: {e}")),
    }
}

/// Offset of the first intact record at or after `start`, if any
///
/// A short read that is followed by intact records is a damaged length
/// field, not a torn write.
fn next_intact_record(data: &[u8], start: usize) -> Option<usize> {
    let magic = LOG_MAGIC.to_le_bytes();
    (start..data.len().saturating_sub(RECORD_HEADER_SIZE + 3))
        .filter(|&pos| data[pos..pos + 4] == magic)
        .find(|&pos| matches!(parse_record(&data[pos..]), Parsed::Record { .. }))
}

/// Append-only metadata log of one shard
pub struct ShardLog {
    path: PathBuf,
    shard: ShardId,
    writer: BufWriter<File>,
    size: u64,
    next_lsn: u64,
    records: u64,
    sync_on_write: bool,
}

impl std::fmt::Debug for ShardLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardLog")
            .field("path", &self.path)
            .field("shard", &self.shard)
            .field("size", &self.size)
            .field("records", &self.records)
            .finish()
    }
}

impl ShardLog {
    /// Open (or create) a log, replaying every record through `apply`
    ///
    /// A torn final record is truncated with a warning. Damage anywhere else
    /// returns [`Error::ShardCorruption`] and nothing is left open.
    pub fn open<F>(
        path: impl AsRef<Path>,
        shard: ShardId,
        sync_on_write: bool,
        mut apply: F,
    ) -> Result<Self>
    where
        F: FnMut(LogOp),
    {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut offset = 0usize;
        let mut last_lsn = 0u64;
        let mut records = 0u64;
        while offset < data.len() {
            match parse_record(&data[offset..]) {
                Parsed::Record { lsn, op, size } => {
                    apply(op);
                    last_lsn = lsn;
                    records += 1;
                    offset += size;
                }
                Parsed::Torn => {
                    if let Some(next) = next_intact_record(&data, offset + 1) {
                        return Err(Error::ShardCorruption {
                            shard,
                            reason: format!(
                                "unreadable record at offset {offset} followed by intact record at {next} in {}",
                                path.display()
                            ),
                        });
                    }
                    warn!(
                        "Shard {} log has a torn tail at offset {} ({} bytes); truncating",
                        shard,
                        offset,
                        data.len() - offset
                    );
                    break;
                }
                Parsed::Corrupt(reason) => {
                    return Err(Error::ShardCorruption {
                        shard,
                        reason: format!("{reason} (offset {offset} in {})", path.display()),
                    });
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if (offset as u64) < file.metadata()?.len() {
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }
        let writer = BufWriter::new(file);

        debug!(
            "Opened shard {} log {:?}: {} records, last LSN {}",
            shard, path, records, last_lsn
        );
        Ok(Self {
            path,
            shard,
            writer,
            size: offset as u64,
            next_lsn: last_lsn + 1,
            records,
            sync_on_write,
        })
    }

    /// Append one operation, returning its LSN
    pub fn append(&mut self, op: &LogOp) -> Result<u64> {
        let lsn = self.next_lsn;
        let bytes = encode_record(lsn, op)?;
        self.writer.write_all(&bytes)?;
        if self.sync_on_write {
            self.writer.flush()?;
            self.writer.get_ref().sync_data()?;
        }
        self.next_lsn += 1;
        self.records += 1;
        self.size += bytes.len() as u64;
        Ok(lsn)
    }

    /// Replace the log contents with exactly `ops`
    ///
    /// Written to a sibling file and renamed over the live one, so a crash
    /// leaves either the old or the new log.
    pub fn rewrite(&mut self, ops: impl IntoIterator<Item = LogOp>) -> Result<()> {
        let new_path = self.path.with_extension("log.new");
        let mut size = 0u64;
        let mut records = 0u64;
        let mut lsn = self.next_lsn;
        {
            let file = File::create(&new_path)?;
            let mut writer = BufWriter::new(file);
            for op in ops {
                let bytes = encode_record(lsn, &op)?;
                writer.write_all(&bytes)?;
                size += bytes.len() as u64;
                records += 1;
                lsn += 1;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        self.writer.flush()?;
        fs::rename(&new_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.size = size;
        self.records = records;
        self.next_lsn = lsn;

        debug!(
            "Rewrote shard {} log: {} records, {} bytes",
            self.shard, records, size
        );
        Ok(())
    }

    /// Flush buffered records and sync them to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of records in the log
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Log size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last assigned LSN
    #[must_use]
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn.saturating_sub(1)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(n: u64) -> LogOp {
        LogOp::Put(LogRecord {
            key: Some(format!("/img/{n}.jpg")),
            relative_path: format!("ab/cd/{n}.blob"),
            size_bytes: n * 10,
            created_ms: n,
            modified_ms: n,
        })
    }

    fn replay(path: &Path) -> Result<(ShardLog, Vec<LogOp>)> {
        let mut ops = Vec::new();
        let log = ShardLog::open(path, 0, true, |op| ops.push(op))?;
        Ok((log, ops))
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.log");
        {
            let (mut log, ops) = replay(&path).unwrap();
            assert!(ops.is_empty());
            assert_eq!(log.append(&put(1)).unwrap(), 1);
            assert_eq!(log.append(&put(2)).unwrap(), 2);
            log.append(&LogOp::Delete {
                relative_path: "ab/cd/1.blob".into(),
            })
            .unwrap();
        }

        let (mut log, ops) = replay(&path).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[1], put(2));
        assert_eq!(log.current_lsn(), 3);
        assert_eq!(log.append(&put(4)).unwrap(), 4);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.log");
        {
            let (mut log, _) = replay(&path).unwrap();
            log.append(&put(1)).unwrap();
            log.append(&put(2)).unwrap();
        }
        let full = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 5).unwrap();
        drop(file);

        let (mut log, ops) = replay(&path).unwrap();
        assert_eq!(ops, vec![put(1)]);
        assert!(log.size() < full - 5);
        assert_eq!(fs::metadata(&path).unwrap().len(), log.size());

        // Appending after truncation yields a clean log
        log.append(&put(3)).unwrap();
        drop(log);
        let (_, ops) = replay(&path).unwrap();
        assert_eq!(ops, vec![put(1), put(3)]);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.log");
        {
            let (mut log, _) = replay(&path).unwrap();
            log.append(&put(1)).unwrap();
            log.append(&put(2)).unwrap();
        }
        let mut data = fs::read(&path).unwrap();
        data[RECORD_HEADER_SIZE + 2] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let err = replay(&path).unwrap_err();
        assert!(matches!(err, Error::ShardCorruption { shard: 0, .. }));
    }

    #[test]
    fn test_damaged_length_mid_log_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.log");
        let record_len = {
            let (mut log, _) = replay(&path).unwrap();
            for n in 0..50 {
                log.append(&put(n)).unwrap();
            }
            log.sync().unwrap();
            encode_record(1, &put(0)).unwrap().len()
        };
        let before = fs::metadata(&path).unwrap().len();

        // Third record claims a length running past the end of the file
        let mut data = fs::read(&path).unwrap();
        let len_at = 2 * record_len + 12;
        data[len_at..len_at + 4].copy_from_slice(&1_000_000u32.to_le_bytes());
        fs::write(&path, &data).unwrap();

        let err = replay(&path).unwrap_err();
        assert!(matches!(err, Error::ShardCorruption { shard: 0, .. }));
        // Nothing is truncated; the file is left for quarantine
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.log");
        let (mut log, _) = replay(&path).unwrap();
        for n in 0..20 {
            log.append(&put(n)).unwrap();
        }
        let before = log.size();

        log.rewrite(vec![put(7), put(9)]).unwrap();
        assert_eq!(log.record_count(), 2);
        assert!(log.size() < before);
        log.append(&put(11)).unwrap();
        drop(log);

        let (_, ops) = replay(&path).unwrap();
        assert_eq!(ops, vec![put(7), put(9), put(11)]);
        assert!(!dir.path().join("meta.log.new").exists());
    }
}
