//! Shared results table for debate runs.
//!
//! Every debate process appends its outcome row to one CSV file. Writers are
//! serialized through an advisory OS lock on `<table>.lock`; the kernel drops
//! the lock when the holding process exits, so a crashed writer never leaves
//! the table permanently locked. Waiting for the lock is bounded.

use chrono::Utc;
use debate_core::{atomic_write_bytes, ensure_dir, ResultRecord};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_TABLE_PATH: &str = "all_debates_summary.csv";
pub const LOCK_SUFFIX: &str = ".lock";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "timed out after {:.1}s waiting for result table lock {path} (holder: {holder})",
        .waited.as_secs_f64()
    )]
    LockTimeout {
        path: PathBuf,
        waited: Duration,
        holder: String,
    },
    #[error("result table {path} is unreadable: {reason}")]
    CorruptTable { path: PathBuf, reason: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode result table: {0}")]
    Encode(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Handle on the results table. Cheap to clone; each append opens its own
/// lock handle, so clones may be used from different threads.
#[derive(Debug, Clone)]
pub struct ResultStore {
    table_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl ResultStore {
    pub fn new(table_path: impl Into<PathBuf>) -> Self {
        let table_path = table_path.into();
        let lock_path = lock_path_for(&table_path);
        Self {
            table_path,
            lock_path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Appends one row under the table lock.
    ///
    /// The whole read-modify-write cycle runs inside the critical section. A
    /// table that exists but cannot be parsed is replaced by a table holding
    /// only `record`; the previous rows are lost and a warning is logged.
    pub fn append(&self, record: &ResultRecord) -> Result<(), StoreError> {
        let _lock = TableLock::acquire(&self.lock_path, self.lock_timeout)?;

        let mut rows = match load_table(&self.table_path) {
            Ok(rows) => rows,
            Err(StoreError::CorruptTable { path, reason }) => {
                warn!(
                    msg_type = "system",
                    path = %path.display(),
                    error = %reason,
                    "Error reading existing result table, recreating it with the new row only"
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        rows.push(record.clone());

        let bytes = encode_table(&rows)?;
        atomic_write_bytes(&self.table_path, &bytes)
            .map_err(|e| StoreError::io(&self.table_path, e))?;
        info!(
            msg_type = "system",
            path = %self.table_path.display(),
            rows = rows.len(),
            "Successfully updated debate summary"
        );
        Ok(())
    }

    /// Reads every row without taking the lock. Tables are replaced by
    /// rename, so a reader never observes a partial write.
    pub fn read_all(&self) -> Result<Vec<ResultRecord>, StoreError> {
        load_table(&self.table_path)
    }
}

pub fn lock_path_for(table_path: &Path) -> PathBuf {
    let mut raw = table_path.as_os_str().to_os_string();
    raw.push(LOCK_SUFFIX);
    PathBuf::from(raw)
}

#[derive(Debug)]
struct TableLock {
    file: File,
}

impl TableLock {
    fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| StoreError::io(lock_path, e))?;

        let started = Instant::now();
        loop {
            // Fully qualified: std's File grew inherent lock methods with
            // different signatures.
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(StoreError::LockTimeout {
                            path: lock_path.to_path_buf(),
                            waited,
                            holder: read_holder(lock_path),
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL.min(timeout - waited));
                }
                Err(e) => return Err(StoreError::io(lock_path, e)),
            }
        }
        debug!(path = %lock_path.display(), waited_ms = started.elapsed().as_millis() as u64, "acquired result table lock");

        let lock = TableLock { file };
        lock.write_holder();
        Ok(lock)
    }

    fn write_holder(&self) {
        let payload = format!(
            "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        let mut handle = &self.file;
        let _ = handle.set_len(0);
        let _ = handle.seek(SeekFrom::Start(0));
        let _ = handle.write_all(payload.as_bytes());
        let _ = handle.flush();
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn read_holder(lock_path: &Path) -> String {
    fs::read_to_string(lock_path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn load_table(path: &Path) -> Result<Vec<ResultRecord>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StoreError::CorruptTable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };
    decode_table(&bytes).map_err(|reason| StoreError::CorruptTable {
        path: path.to_path_buf(),
        reason,
    })
}

fn decode_table(bytes: &[u8]) -> Result<Vec<ResultRecord>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    if !headers.iter().eq(ResultRecord::COLUMNS.iter().copied()) {
        return Err(format!(
            "unexpected header row {:?} (expected {:?})",
            headers.iter().collect::<Vec<_>>(),
            ResultRecord::COLUMNS
        ));
    }
    reader
        .deserialize::<ResultRecord>()
        .map(|row| row.map_err(|e| e.to_string()))
        .collect()
}

fn encode_table(rows: &[ResultRecord]) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(ResultRecord::COLUMNS)
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| StoreError::Encode(e.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::Encode(e.to_string()))
}
