//! Blob file format
//!
//! Each cached response is stored as one file:
//! ```text
//! +-------+--------+--------------+-------------+---------+--------+
//! | Magic | CT len | Content type | Payload len | Payload | CRC32C |
//! | 4B    | 2B     | var          | 8B          | var     | 4B     |
//! +-------+--------+--------------+-------------+---------+--------+
//! ```
//! The CRC covers everything before it. A file that fails any check is never
//! served; the caller treats it as a miss.

use bytes::Bytes;
use rendercache_common::{CachedBlob, Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Blob magic number
const BLOB_MAGIC: u32 = 0x5243_4231; // "RCB1"

/// Fixed overhead: magic + content type length + payload length + CRC
pub const BLOB_OVERHEAD: usize = 4 + 2 + 8 + 4;

/// Serialize a blob to its on-disk representation
pub fn encode(blob: &CachedBlob) -> Result<Vec<u8>> {
    let content_type = blob.content_type.as_bytes();
    let ct_len = u16::try_from(content_type.len())
        .map_err(|_| Error::Serialization("content type longer than 65535 bytes".into()))?;

    let mut buf = Vec::with_capacity(BLOB_OVERHEAD + content_type.len() + blob.bytes.len());
    buf.extend_from_slice(&BLOB_MAGIC.to_le_bytes());
    buf.extend_from_slice(&ct_len.to_le_bytes());
    buf.extend_from_slice(content_type);
    buf.extend_from_slice(&(blob.bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(&blob.bytes);

    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parse and verify an on-disk blob
pub fn decode(data: &[u8]) -> Result<CachedBlob> {
    if data.len() < BLOB_OVERHEAD {
        return Err(Error::BlobCorrupt("file too small".into()));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let stored_crc = u32::from_le_bytes(read_array(crc_bytes, 0)?);
    if crc32c::crc32c(body) != stored_crc {
        return Err(Error::BlobCorrupt("CRC mismatch".into()));
    }

    let magic = u32::from_le_bytes(read_array(body, 0)?);
    if magic != BLOB_MAGIC {
        return Err(Error::BlobCorrupt("invalid magic".into()));
    }
    let ct_len = u16::from_le_bytes(read_array(body, 4)?) as usize;
    let ct_end = 6 + ct_len;
    let content_type = body
        .get(6..ct_end)
        .ok_or_else(|| Error::BlobCorrupt("content type truncated".into()))?;
    let content_type = std::str::from_utf8(content_type)
        .map_err(|_| Error::BlobCorrupt("content type is not UTF-8".into()))?;

    let payload_len = u64::from_le_bytes(read_array(body, ct_end)?) as usize;
    let payload_start = ct_end + 8;
    if body.len() - payload_start != payload_len {
        return Err(Error::BlobCorrupt(format!(
            "payload length {} does not match header {}",
            body.len() - payload_start,
            payload_len
        )));
    }

    Ok(CachedBlob {
        bytes: Bytes::copy_from_slice(&body[payload_start..]),
        content_type: content_type.to_string(),
    })
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::BlobCorrupt("header truncated".into()))
}

/// Write a blob so that readers see either nothing or the complete file
///
/// The data is staged in `staging_dir` and renamed into place; both paths must
/// be on the same filesystem. Returns the number of bytes written.
pub fn write_atomic(staging_dir: &Path, target: &Path, blob: &CachedBlob) -> Result<u64> {
    let data = encode(blob)?;
    fs::create_dir_all(staging_dir)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let staging = staging_dir.join(format!("{}.tmp", uuid::Uuid::new_v4()));
    let result = (|| -> Result<()> {
        let mut file = File::create(&staging)?;
        file.write_all(&data)?;
        file.sync_data()?;
        fs::rename(&staging, target)?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    Ok(data.len() as u64)
}

/// Read and verify a blob file
pub fn read(path: &Path) -> Result<CachedBlob> {
    let data = fs::read(path)?;
    decode(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_encode_decode() {
        let blob = CachedBlob::new(vec![1u8, 2, 3, 4], "image/webp");
        let data = encode(&blob).unwrap();
        assert_eq!(data.len(), BLOB_OVERHEAD + "image/webp".len() + 4);
        assert_eq!(decode(&data).unwrap(), blob);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let blob = CachedBlob::new(vec![7u8; 256], "image/png");
        let data = encode(&blob).unwrap();
        for cut in [0, 3, BLOB_OVERHEAD, data.len() - 1] {
            assert!(decode(&data[..cut]).is_err(), "accepted cut at {cut}");
        }
    }

    #[test]
    fn test_bit_flip_rejected() {
        let blob = CachedBlob::new(vec![7u8; 64], "image/png");
        let mut data = encode(&blob).unwrap();
        data[30] ^= 0x01;
        assert!(matches!(decode(&data), Err(Error::BlobCorrupt(_))));
    }

    #[test]
    fn test_write_atomic_and_read() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("blobs/ab/cd/abcd.blob");
        let blob = CachedBlob::new(b"jpeg bytes".to_vec(), "image/jpeg");

        let written = write_atomic(&dir.path().join("tmp"), &target, &blob).unwrap();
        assert_eq!(written, fs::metadata(&target).unwrap().len());
        assert_eq!(read(&target).unwrap(), blob);

        // Staging directory is left empty
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }
}
