//! on-disk layout for records and the leaf hash cache
//!
//! one json file per occupied label, named by the decimal label value,
//! written via temp file + rename so a crash leaves either the old or the
//! new version intact. the `hash_cache` file holds the concatenated leaf
//! hashes plus a sha256 checksum trailer; it is an optimization only and
//! is rebuilt from the record files whenever it fails to parse.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::label::TreeShape;
use crate::{hex_bytes, Hash};

const CACHE_FILE: &str = "hash_cache";

#[derive(Serialize, Deserialize)]
struct RecordFile {
    #[serde(with = "hex_bytes")]
    mac: Vec<u8>,
    #[serde(with = "hex_bytes")]
    metadata: Vec<u8>,
}

fn record_path(dir: &Path, label: u64) -> PathBuf {
    dir.join(label.to_string())
}

/// write bytes to `path` atomically with respect to crash
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    // persist the rename itself
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

pub(crate) fn write_record(dir: &Path, label: u64, mac: &[u8], metadata: &[u8]) -> Result<()> {
    let record = RecordFile { mac: mac.to_vec(), metadata: metadata.to_vec() };
    let bytes = serde_json::to_vec(&record).map_err(|_| Error::CorruptRecord(label))?;
    write_atomic(dir, &record_path(dir, label), &bytes)
}

/// read a record file; `Ok(None)` means no record exists for this label
pub(crate) fn read_record(dir: &Path, label: u64) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let bytes = match fs::read(record_path(dir, label)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let record: RecordFile =
        serde_json::from_slice(&bytes).map_err(|_| Error::CorruptRecord(label))?;
    Ok(Some((record.mac, record.metadata)))
}

pub(crate) fn remove_record(dir: &Path, label: u64) -> Result<()> {
    fs::remove_file(record_path(dir, label))?;
    Ok(())
}

/// labels of all record files present on disk
pub(crate) fn scan_labels(dir: &Path) -> Result<Vec<u64>> {
    let mut labels = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(label) = name.parse::<u64>() {
                labels.push(label);
            }
        }
    }
    labels.sort_unstable();
    Ok(labels)
}

pub(crate) fn write_cache(dir: &Path, shape: TreeShape, leaves: &[Hash]) -> Result<()> {
    let mut bytes = Vec::with_capacity(2 + leaves.len() * 32 + 32);
    bytes.push(shape.bits_per_level());
    bytes.push(shape.height());
    for leaf in leaves {
        bytes.extend_from_slice(leaf);
    }
    let checksum: Hash = Sha256::digest(&bytes).into();
    bytes.extend_from_slice(&checksum);
    write_atomic(dir, &dir.join(CACHE_FILE), &bytes)
}

/// read and verify the leaf hash cache; any inconsistency is `CorruptCache`
pub(crate) fn read_cache(dir: &Path, shape: TreeShape) -> Result<Vec<Hash>> {
    let bytes = fs::read(dir.join(CACHE_FILE)).map_err(|_| Error::CorruptCache)?;
    let num_leaves = shape.num_labels() as usize;
    let expected_len = 2 + num_leaves * 32 + 32;
    if bytes.len() != expected_len
        || bytes[0] != shape.bits_per_level()
        || bytes[1] != shape.height()
    {
        return Err(Error::CorruptCache);
    }
    let (payload, trailer) = bytes.split_at(expected_len - 32);
    let checksum: Hash = Sha256::digest(payload).into();
    if checksum[..] != *trailer {
        return Err(Error::CorruptCache);
    }
    let mut leaves = Vec::with_capacity(num_leaves);
    for chunk in payload[2..].chunks_exact(32) {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(chunk);
        leaves.push(hash);
    }
    Ok(leaves)
}

pub(crate) fn remove_all(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), 7, b"mac", b"meta").unwrap();
        let (mac, metadata) = read_record(dir.path(), 7).unwrap().unwrap();
        assert_eq!(mac, b"mac");
        assert_eq!(metadata, b"meta");
    }

    #[test]
    fn test_absent_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_record(dir.path(), 3).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(record_path(dir.path(), 5), b"not json").unwrap();
        assert!(matches!(
            read_record(dir.path(), 5),
            Err(Error::CorruptRecord(5))
        ));
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let shape = TreeShape::new(1, 2).unwrap();
        let leaves = vec![[1u8; 32], [2u8; 32], [3u8; 32], [4u8; 32]];
        write_cache(dir.path(), shape, &leaves).unwrap();
        assert_eq!(read_cache(dir.path(), shape).unwrap(), leaves);
    }

    #[test]
    fn test_cache_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let shape = TreeShape::new(1, 2).unwrap();
        write_cache(dir.path(), shape, &[[9u8; 32]; 4]).unwrap();
        let path = dir.path().join(CACHE_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_cache(dir.path(), shape), Err(Error::CorruptCache)));
    }
}
