//! Synchronous, size-limited key/value storage primitives.
//!
//! The durable cache sits on top of a [`StorageBackend`]. Two backends are
//! provided: [`MemoryStorage`] (process-local, used by tests and ephemeral
//! sessions) and [`FileStorage`] (one checksummed file per key, survives
//! restarts). Both report usage through [`StorageBackend::estimate`] when a
//! quota is configured, which is what the quota monitor reads.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use walkdir::WalkDir;

use super::lock_unpoisoned;
use super::types::{CacheConfig, CacheError, CacheResult, StorageEstimate};

const ENTRY_EXTENSION: &str = "entry";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Persistent key/value store used by the durable cache.
///
/// Implementations must be internally synchronised; callers never hold a
/// lock across calls.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Read the raw bytes stored under `key`.
    ///
    /// Returns `Err(CacheError::CorruptedEntry)` when the stored record fails
    /// its integrity checks.
    fn read(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// Returns `Err(CacheError::QuotaExceeded)` when the write would exceed
    /// the configured quota; the previous value is left untouched.
    fn write(&self, key: &str, value: &[u8]) -> CacheResult<()>;

    /// Remove `key`, returning whether it existed.
    fn delete(&self, key: &str) -> CacheResult<bool>;

    /// All keys currently stored, in ascending order.
    fn keys(&self) -> CacheResult<Vec<String>>;

    /// Usage and quota, if this backend can introspect them.
    fn estimate(&self) -> Option<StorageEstimate>;
}

/// In-memory storage with an optional byte quota.
///
/// An entry accounts for `key.len() + value.len()` bytes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    quota: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota: Some(quota_bytes),
        }
    }

    fn usage(entries: &BTreeMap<String, Vec<u8>>) -> u64 {
        entries
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(lock_unpoisoned(&self.entries).get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        let mut entries = lock_unpoisoned(&self.entries);
        if let Some(quota) = self.quota {
            let current = Self::usage(&entries);
            let replaced = entries
                .get(key)
                .map(|old| (key.len() + old.len()) as u64)
                .unwrap_or(0);
            let requested = (key.len() + value.len()) as u64;
            let available = quota.saturating_sub(current - replaced);
            if requested > available {
                return Err(CacheError::QuotaExceeded {
                    requested,
                    available,
                });
            }
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(lock_unpoisoned(&self.entries).remove(key).is_some())
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(lock_unpoisoned(&self.entries).keys().cloned().collect())
    }

    fn estimate(&self) -> Option<StorageEstimate> {
        let quota = self.quota?;
        let usage = Self::usage(&lock_unpoisoned(&self.entries));
        Some(StorageEstimate { usage, quota })
    }
}

/// File-backed storage: one file per key under `<root>/entries`.
///
/// Each file holds the hex SHA-256 of the payload, a newline, and the
/// payload (gzip-compressed when compression is enabled). File names are the
/// hex-encoded key so keys can be recovered from a directory listing.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    quota: Option<u64>,
    enable_compression: bool,
}

impl FileStorage {
    /// Create file storage with the default configuration
    pub fn new(root: impl AsRef<Path>) -> CacheResult<Self> {
        Self::with_config(root, &CacheConfig::default())
    }

    /// Create file storage with custom configuration
    pub fn with_config(root: impl AsRef<Path>, config: &CacheConfig) -> CacheResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("entries"))?;

        Ok(Self {
            root,
            quota: config.storage_quota_bytes,
            enable_compression: config.enable_compression,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.entries_dir()
            .join(format!("{}.{}", hex::encode(key), ENTRY_EXTENSION))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn encode_record(&self, value: &[u8]) -> CacheResult<Vec<u8>> {
        let payload = if self.enable_compression {
            compress_data(value)?
        } else {
            value.to_vec()
        };
        let checksum = hex::encode(Sha256::digest(&payload));
        let mut record = Vec::with_capacity(checksum.len() + 1 + payload.len());
        record.extend_from_slice(checksum.as_bytes());
        record.push(b'\n');
        record.extend_from_slice(&payload);
        Ok(record)
    }

    fn decode_record(key: &str, record: &[u8]) -> CacheResult<Vec<u8>> {
        let split = record
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| CacheError::CorruptedEntry(format!("{key}: missing checksum")))?;
        let (checksum, payload) = (&record[..split], &record[split + 1..]);
        let expected = hex::encode(Sha256::digest(payload));
        if checksum != expected.as_bytes() {
            return Err(CacheError::CorruptedEntry(format!(
                "{key}: checksum mismatch"
            )));
        }
        if payload.starts_with(&GZIP_MAGIC) {
            decompress_data(payload)
                .map_err(|e| CacheError::CorruptedEntry(format!("{key}: {e}")))
        } else {
            Ok(payload.to_vec())
        }
    }

    /// Calculate disk usage
    fn disk_usage(&self) -> CacheResult<u64> {
        let mut total = 0u64;
        for entry in WalkDir::new(self.entries_dir()).min_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

impl StorageBackend for FileStorage {
    fn read(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let record = match fs::read(self.entry_path(key)) {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode_record(key, &record).map(Some)
    }

    fn write(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        let record = self.encode_record(value)?;
        let path = self.entry_path(key);

        if let Some(quota) = self.quota {
            let current = self.disk_usage()?;
            let replaced = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let requested = record.len() as u64;
            let available = quota.saturating_sub(current.saturating_sub(replaced));
            if requested > available {
                return Err(CacheError::QuotaExceeded {
                    requested,
                    available,
                });
            }
        }

        // Write through a temp file so a crash never leaves a torn record.
        let mut tmp = tempfile::NamedTempFile::new_in(self.entries_dir())?;
        tmp.write_all(&record)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!("Stored {} bytes for: {}", record.len(), key);
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(self.entries_dir()).min_depth(1).max_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file() {
                if let Some(key) = Self::key_from_path(entry.path()) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn estimate(&self) -> Option<StorageEstimate> {
        let quota = self.quota?;
        let usage = self.disk_usage().ok()?;
        Some(StorageEstimate { usage, quota })
    }
}

/// Compress data using gzip
fn compress_data(data: &[u8]) -> CacheResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress gzip-compressed data
fn decompress_data(data: &[u8]) -> CacheResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
