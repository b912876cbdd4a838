//! Append-only log file backend for persistent storage.
//!
//! Every `put` and `delete` appends one record to a single log file. The
//! live key set is rebuilt by replaying the log on open and kept in memory;
//! [`FileBackend::compact`] rewrites the log so it only holds live entries.
//!
//! ## Record layout (little-endian)
//!
//! ```text
//! | record_len (4) | op (1) | key_len (4) | key | value | crc32 (4) |
//! ```
//!
//! `record_len` counts the whole record including itself and the checksum.
//! The checksum covers every byte before it.

use crate::backend::{KvBackend, KvIter};
use crate::checksum::crc32;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const HEADER_SIZE: usize = 9;
const CRC_SIZE: usize = 4;

/// Options for opening a [`FileBackend`].
#[derive(Debug, Clone)]
pub struct FileBackendConfig {
    /// Create the log file if it does not exist.
    pub create_if_missing: bool,
    /// Call `sync_data` after every write (safer but slower).
    pub sync_on_write: bool,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: false,
        }
    }
}

impl FileBackendConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the file if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether every write is synced to disk.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}

/// Outcome of [`FileBackend::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    /// Records in the log before compaction.
    pub records_before: u64,
    /// Records in the log after compaction (one per live key).
    pub records_after: u64,
    /// Bytes reclaimed.
    pub bytes_saved: u64,
}

#[derive(Debug)]
struct LogState {
    file: File,
    size: u64,
    records: u64,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// A key-value backend persisted as an append-only log file.
///
/// # Durability
///
/// - Each write is appended and flushed to the OS before returning
/// - With `sync_on_write`, each write also calls `sync_data`
/// - A torn record at the tail of the log (crash mid-append) is truncated
///   on open; corruption anywhere else fails the open
///
/// # Example
///
/// ```no_run
/// use nestdb_storage::{FileBackend, KvBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("users.nest")).unwrap();
/// backend.put(b"k", b"v").unwrap();
/// backend.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    config: FileBackendConfig,
    state: Mutex<LogState>,
}

impl FileBackend {
    /// Opens or creates a log backend at `path` with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the log is corrupt.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_config(path, FileBackendConfig::default())
    }

    /// Opens a log backend with explicit options, replaying the log.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the file is missing and
    /// `create_if_missing` is false, or a corruption error if a record
    /// before the tail fails validation.
    pub fn open_with_config(path: &Path, config: FileBackendConfig) -> StorageResult<Self> {
        if !path.exists() {
            if !config.create_if_missing {
                return Err(StorageError::NotFound {
                    path: path.display().to_string(),
                });
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(config.create_if_missing)
            .truncate(false)
            .open(path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let (entries, records, valid_len) = replay(&raw)?;
        if valid_len < raw.len() as u64 {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = raw.len(),
                "truncating torn record at log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), keys = entries.len(), records, "log replayed");

        Ok(Self {
            path: path.to_path_buf(),
            config,
            state: Mutex::new(LogState {
                file,
                size: valid_len,
                records,
                entries,
            }),
        })
    }

    /// Returns the path to the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if no keys are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current log size in bytes.
    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.state.lock().size
    }

    /// Rewrites the log so it contains exactly one record per live key.
    ///
    /// The new log is written to a sibling temp file, synced, then renamed
    /// over the original, so a crash leaves either the old or the new log.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be written or renamed.
    pub fn compact(&self) -> StorageResult<CompactionStats> {
        let mut state = self.state.lock();
        let tmp_path = self.path.with_extension("compact");

        let mut buf = Vec::new();
        for (key, value) in &state.entries {
            encode_record(&mut buf, OP_PUT, key, value)?;
        }

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let stats = CompactionStats {
            records_before: state.records,
            records_after: state.entries.len() as u64,
            bytes_saved: state.size.saturating_sub(buf.len() as u64),
        };
        state.file = file;
        state.size = buf.len() as u64;
        state.records = stats.records_after;

        debug!(path = %self.path.display(), ?stats, "log compacted");
        Ok(stats)
    }

    fn append(&self, state: &mut LogState, op: u8, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + value.len() + CRC_SIZE);
        encode_record(&mut buf, op, key, value)?;

        state.file.seek(SeekFrom::Start(state.size))?;
        state.file.write_all(&buf)?;
        state.file.flush()?;
        if self.config.sync_on_write {
            state.file.sync_data()?;
        }
        state.size += buf.len() as u64;
        state.records += 1;
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.state.lock().entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.append(&mut state, OP_PUT, key, value)?;
        state.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let mut state = self.state.lock();
        if !state.entries.contains_key(key) {
            return Ok(());
        }
        self.append(&mut state, OP_DELETE, key, &[])?;
        state.entries.remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &[u8]) -> StorageResult<KvIter<'_>> {
        let snapshot: Vec<_> = self
            .state
            .lock()
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn flush(&self) -> StorageResult<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }
}

fn encode_record(buf: &mut Vec<u8>, op: u8, key: &[u8], value: &[u8]) -> StorageResult<()> {
    let record_len = HEADER_SIZE + key.len() + value.len() + CRC_SIZE;
    let record_len =
        u32::try_from(record_len).map_err(|_| StorageError::EntryTooLarge { len: record_len })?;
    let key_len =
        u32::try_from(key.len()).map_err(|_| StorageError::EntryTooLarge { len: key.len() })?;

    let start = buf.len();
    buf.extend_from_slice(&record_len.to_le_bytes());
    buf.push(op);
    buf.extend_from_slice(&key_len.to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = crc32(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

/// Replays a raw log, returning the live entries, the number of records,
/// and the length of the valid prefix.
fn replay(raw: &[u8]) -> StorageResult<(BTreeMap<Vec<u8>, Vec<u8>>, u64, u64)> {
    let mut entries = BTreeMap::new();
    let mut records = 0u64;
    let mut pos = 0usize;

    while pos < raw.len() {
        let remaining = raw.len() - pos;
        if remaining < HEADER_SIZE + CRC_SIZE {
            break;
        }
        let record_len = read_u32(raw, pos) as usize;
        if record_len < HEADER_SIZE + CRC_SIZE {
            return Err(StorageError::corrupt_record(
                pos as u64,
                format!("record length {record_len} below minimum"),
            ));
        }
        if record_len > remaining {
            break;
        }

        let record = &raw[pos..pos + record_len];
        let body = &record[..record_len - CRC_SIZE];
        let expected = read_u32(record, record_len - CRC_SIZE);
        let actual = crc32(body);
        if expected != actual {
            if pos + record_len == raw.len() {
                break;
            }
            return Err(StorageError::ChecksumMismatch {
                offset: pos as u64,
                expected,
                actual,
            });
        }

        let op = record[4];
        let key_len = read_u32(record, 5) as usize;
        if HEADER_SIZE + key_len > body.len() {
            return Err(StorageError::corrupt_record(
                pos as u64,
                format!("key length {key_len} exceeds record"),
            ));
        }
        let key = record[HEADER_SIZE..HEADER_SIZE + key_len].to_vec();
        let value = &body[HEADER_SIZE + key_len..];

        match op {
            OP_PUT => {
                entries.insert(key, value.to_vec());
            }
            OP_DELETE => {
                entries.remove(&key);
            }
            other => {
                return Err(StorageError::corrupt_record(
                    pos as u64,
                    format!("unknown op {other}"),
                ));
            }
        }

        records += 1;
        pos += record_len;
    }

    Ok((entries, records, pos as u64))
}
