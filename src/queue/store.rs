//! Segment Storage Abstraction
//!
//! Everything the queue persists goes through `SegmentStore`: append-only
//! segment files, small metadata files replaced atomically, and the
//! single-owner guard for the directory.
//!
//! ## Implementations
//!
//! - `InMemorySegmentStore`: For unit tests and DST
//! - `LocalSegmentStore`: For production (std::fs + sync_all + fs2 lock)
//! - `SimulatedSegmentStore`: For DST with buggify fault injection
//!
//! Readers returned by `open_read` observe bytes appended after they were
//! opened, the same way a second file handle does on a real filesystem.

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name of the ownership lock file inside a queue directory
pub const LOCK_FILE: &str = ".lock";

/// Error type for segment store operations
#[derive(Debug)]
pub enum StoreError {
    /// I/O error
    Io(IoError),
    /// File not found
    NotFound(String),
    /// Disk full
    DiskFull,
    /// Fsync failed
    FsyncFailed(String),
    /// Partial write detected
    PartialWrite { expected: usize, actual: usize },
    /// Another owner holds the directory
    Locked(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Store I/O error: {}", e),
            StoreError::NotFound(name) => write!(f, "Store file not found: {}", name),
            StoreError::DiskFull => write!(f, "Store disk full"),
            StoreError::FsyncFailed(msg) => write!(f, "Store fsync failed: {}", msg),
            StoreError::PartialWrite { expected, actual } => {
                write!(
                    f,
                    "Store partial write: expected {} bytes, wrote {}",
                    expected, actual
                )
            }
            StoreError::Locked(owner) => write!(f, "Store is locked: {}", owner),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<IoError> for StoreError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            _ if e.to_string().contains("No space left") => StoreError::DiskFull,
            _ => StoreError::Io(e),
        }
    }
}

/// Append handle for one segment file
pub trait SegmentWriter: Send {
    /// Append data. Returns the file size after the write.
    fn append(&mut self, data: &[u8]) -> Result<u64, StoreError>;
    /// Make everything appended so far durable.
    fn sync(&mut self) -> Result<(), StoreError>;
    /// Current size of the file in bytes.
    fn size(&self) -> u64;
    /// Cut the file back to `len` bytes; later appends continue from there.
    fn truncate(&mut self, len: u64) -> Result<(), StoreError>;
}

/// Storage backend for one queue directory
pub trait SegmentStore: Send + Sync + 'static {
    type Writer: SegmentWriter;
    type Reader: Read + Seek + Send;
    /// Held for as long as the directory is owned; dropping releases it
    type Guard: Send + Sync;

    /// Create (or truncate) a file for appending.
    fn create(&self, name: &str) -> Result<Self::Writer, StoreError>;
    /// Open an existing file for appending at its end; `NotFound` if missing.
    fn open_append(&self, name: &str) -> Result<Self::Writer, StoreError>;
    /// Open a file for reading from offset 0.
    fn open_read(&self, name: &str) -> Result<Self::Reader, StoreError>;
    /// List all file names, sorted alphabetically.
    fn list(&self) -> Result<Vec<String>, StoreError>;
    /// Delete a file. Missing files are not an error.
    fn delete(&self, name: &str) -> Result<(), StoreError>;
    /// Check if a file exists.
    fn exists(&self, name: &str) -> Result<bool, StoreError>;
    /// Whole contents of a small file, `None` if it does not exist.
    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Replace a small file so readers see either the old or the new bytes.
    fn write_file_atomic(&self, name: &str, data: &[u8]) -> Result<(), StoreError>;
    /// Take exclusive ownership of the directory; `Locked` if already owned.
    fn acquire(&self) -> Result<Self::Guard, StoreError>;
}

// ============================================================================
// InMemorySegmentStore - For unit tests and DST
// ============================================================================

/// In-memory file data
#[derive(Debug, Clone, Default)]
struct InMemoryFile {
    data: Vec<u8>,
    /// Position up to which data is "synced" (durable)
    synced_pos: usize,
}

type FileMap = Arc<Mutex<HashMap<String, InMemoryFile>>>;

/// In-memory segment store for unit tests and deterministic simulation
#[derive(Debug, Clone, Default)]
pub struct InMemorySegmentStore {
    files: FileMap,
    locked: Arc<AtomicBool>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of a file (for testing/crash simulation)
    pub fn get_file_data(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|f| f.data.clone())
    }

    /// Append raw bytes to a file, creating it if needed
    pub fn append_raw(&self, name: &str, data: &[u8]) {
        let mut files = self.files.lock();
        let file = files.entry(name.to_string()).or_default();
        file.data.extend_from_slice(data);
        file.synced_pos = file.data.len();
    }

    /// Truncate a file to a given length (for crash simulation)
    pub fn truncate_file(&self, name: &str, len: usize) {
        let mut files = self.files.lock();
        if let Some(file) = files.get_mut(name) {
            file.data.truncate(len);
            if file.synced_pos > len {
                file.synced_pos = len;
            }
        }
    }

    /// Simulate a crash: truncate all files to their synced position and
    /// drop the ownership lock. Un-synced data is lost.
    pub fn simulate_crash(&self) {
        let mut files = self.files.lock();
        for file in files.values_mut() {
            file.data.truncate(file.synced_pos);
        }
        self.locked.store(false, Ordering::Release);
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }
}

/// In-memory file writer
pub struct InMemorySegmentWriter {
    name: String,
    files: FileMap,
    current_size: u64,
}

impl SegmentWriter for InMemorySegmentWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        debug_assert!(!data.is_empty(), "Precondition: data must not be empty");

        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| StoreError::NotFound(self.name.clone()))?;
        file.data.extend_from_slice(data);
        self.current_size = file.data.len() as u64;

        debug_assert!(
            self.current_size >= data.len() as u64,
            "Postcondition: size must be at least data length"
        );

        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        let mut files = self.files.lock();
        if let Some(file) = files.get_mut(&self.name) {
            file.synced_pos = file.data.len();
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.current_size
    }

    fn truncate(&mut self, len: u64) -> Result<(), StoreError> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| StoreError::NotFound(self.name.clone()))?;
        file.data.truncate(len as usize);
        file.synced_pos = file.synced_pos.min(file.data.len());
        self.current_size = file.data.len() as u64;
        Ok(())
    }
}

/// In-memory file reader; sees later appends
pub struct InMemorySegmentReader {
    name: String,
    files: FileMap,
    pos: u64,
}

impl Read for InMemorySegmentReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let files = self.files.lock();
        let data = match files.get(&self.name) {
            Some(file) => &file.data,
            None => return Ok(0),
        };
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for InMemorySegmentReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self
            .files
            .lock()
            .get(&self.name)
            .map(|f| f.data.len() as u64)
            .unwrap_or(0);
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            IoError::new(ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.pos = target;
        Ok(target)
    }
}

/// Ownership guard for the in-memory store
#[derive(Debug)]
pub struct InMemoryGuard {
    locked: Arc<AtomicBool>,
}

impl Drop for InMemoryGuard {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl SegmentStore for InMemorySegmentStore {
    type Writer = InMemorySegmentWriter;
    type Reader = InMemorySegmentReader;
    type Guard = InMemoryGuard;

    fn create(&self, name: &str) -> Result<Self::Writer, StoreError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        self.files
            .lock()
            .insert(name.to_string(), InMemoryFile::default());

        Ok(InMemorySegmentWriter {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            current_size: 0,
        })
    }

    fn open_append(&self, name: &str) -> Result<Self::Writer, StoreError> {
        let size = self
            .files
            .lock()
            .get(name)
            .map(|f| f.data.len() as u64)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(InMemorySegmentWriter {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            current_size: size,
        })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, StoreError> {
        if !self.files.lock().contains_key(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(InMemorySegmentReader {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            pos: 0,
        })
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.files.lock().contains_key(name))
    }

    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get_file_data(name))
    }

    fn write_file_atomic(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        self.files.lock().insert(
            name.to_string(),
            InMemoryFile {
                data: data.to_vec(),
                synced_pos: data.len(),
            },
        );
        Ok(())
    }

    fn acquire(&self) -> Result<Self::Guard, StoreError> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::Locked("in-memory store".to_string()));
        }
        Ok(InMemoryGuard {
            locked: Arc::clone(&self.locked),
        })
    }
}

// ============================================================================
// LocalSegmentStore - For production
// ============================================================================

/// Local filesystem store rooted at one queue directory
#[derive(Debug, Clone)]
pub struct LocalSegmentStore {
    dir: PathBuf,
}

impl LocalSegmentStore {
    /// Create a new local store. Creates the directory if it doesn't exist.
    pub fn new(dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)?;
        Ok(LocalSegmentStore { dir })
    }

    /// Use an existing directory; nothing is created. `NotFound` if missing.
    pub fn open_existing(dir: PathBuf) -> Result<Self, StoreError> {
        if !dir.is_dir() {
            return Err(StoreError::NotFound(dir.display().to_string()));
        }
        Ok(LocalSegmentStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Local filesystem segment writer
pub struct LocalSegmentWriter {
    file: std::fs::File,
    current_size: u64,
}

impl SegmentWriter for LocalSegmentWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        debug_assert!(!data.is_empty(), "Precondition: data must not be empty");

        self.file.write_all(data)?;
        self.current_size = self.current_size.saturating_add(data.len() as u64);

        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        self.file
            .sync_data()
            .map_err(|e| StoreError::FsyncFailed(e.to_string()))
    }

    fn size(&self) -> u64 {
        self.current_size
    }

    fn truncate(&mut self, len: u64) -> Result<(), StoreError> {
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        self.current_size = len;
        Ok(())
    }
}

/// Exclusive `fs2` lock on `<dir>/.lock`, released when the file closes
#[derive(Debug)]
pub struct LocalGuard {
    _file: std::fs::File,
}

impl SegmentStore for LocalSegmentStore {
    type Writer = LocalSegmentWriter;
    type Reader = std::fs::File;
    type Guard = LocalGuard;

    fn create(&self, name: &str) -> Result<Self::Writer, StoreError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.file_path(name))?;
        Ok(LocalSegmentWriter {
            file,
            current_size: 0,
        })
    }

    fn open_append(&self, name: &str) -> Result<Self::Writer, StoreError> {
        let mut file = match std::fs::OpenOptions::new().write(true).open(self.file_path(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        let current_size = file.seek(SeekFrom::End(0))?;
        Ok(LocalSegmentWriter { file, current_size })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, StoreError> {
        match std::fs::File::open(self.file_path(name)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.file_path(name).exists())
    }

    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.file_path(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn write_file_atomic(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let tmp_path = self.file_path(&format!("{}.tmp", name));
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(data)?;
            tmp.sync_data()
                .map_err(|e| StoreError::FsyncFailed(e.to_string()))?;
        }
        std::fs::rename(&tmp_path, self.file_path(name))?;
        Ok(())
    }

    fn acquire(&self) -> Result<Self::Guard, StoreError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.file_path(LOCK_FILE))?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(self.dir.display().to_string()))?;
        Ok(LocalGuard { _file: file })
    }
}

// ============================================================================
// SimulatedSegmentStore - For DST with buggify fault injection
// ============================================================================

use crate::buggify::faults::disk as disk_faults;
use crate::io::Rng;

/// Configuration for simulated disk fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    pub write_fail_prob: f64,
    pub partial_write_prob: f64,
    pub fsync_fail_prob: f64,
    pub disk_full_prob: f64,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            write_fail_prob: 0.01,
            partial_write_prob: 0.005,
            fsync_fail_prob: 0.005,
            disk_full_prob: 0.001,
        }
    }
}

impl SimulatedStoreConfig {
    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            write_fail_prob: 0.0,
            partial_write_prob: 0.0,
            fsync_fail_prob: 0.0,
            disk_full_prob: 0.0,
        }
    }

    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            write_fail_prob: 0.05,
            partial_write_prob: 0.02,
            fsync_fail_prob: 0.02,
            disk_full_prob: 0.005,
        }
    }
}

/// Statistics for disk fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub write_attempts: u64,
    pub write_failures: u64,
    pub partial_writes: u64,
    pub sync_attempts: u64,
    pub sync_failures: u64,
    pub disk_full_errors: u64,
}

struct SimulatedStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
}

/// In-memory store with fault injection on the write path
pub struct SimulatedSegmentStore<R: Rng> {
    inner: InMemorySegmentStore,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<R: Rng> SimulatedSegmentStore<R> {
    pub fn new(rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedSegmentStore {
            inner: InMemorySegmentStore::new(),
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// The underlying in-memory store (for crash simulation)
    pub fn inner_store(&self) -> &InMemorySegmentStore {
        &self.inner
    }
}

impl<R: Rng> Clone for SimulatedSegmentStore<R> {
    fn clone(&self) -> Self {
        SimulatedSegmentStore {
            inner: self.inner.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Simulated segment writer with fault injection
pub struct SimulatedSegmentWriter<R: Rng> {
    inner: InMemorySegmentWriter,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<R: Rng> SegmentWriter for SimulatedSegmentWriter<R> {
    fn append(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        {
            let mut s = self.state.lock();
            let s = &mut *s;
            s.stats.write_attempts = s.stats.write_attempts.saturating_add(1);

            if crate::buggify!(&mut s.rng, disk_faults::DISK_FULL, self.config.disk_full_prob) {
                s.stats.disk_full_errors = s.stats.disk_full_errors.saturating_add(1);
                return Err(StoreError::DiskFull);
            }

            if crate::buggify!(&mut s.rng, disk_faults::WRITE_FAIL, self.config.write_fail_prob) {
                s.stats.write_failures = s.stats.write_failures.saturating_add(1);
                return Err(StoreError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated write failure",
                )));
            }

            // Torn write: a prefix lands on disk, then the call fails
            if data.len() > 1
                && crate::buggify!(
                    &mut s.rng,
                    disk_faults::PARTIAL_WRITE,
                    self.config.partial_write_prob
                )
            {
                s.stats.partial_writes = s.stats.partial_writes.saturating_add(1);
                let partial_len = s.rng.gen_range(1, data.len() as u64) as usize;
                let _ = self.inner.append(&data[..partial_len]);
                return Err(StoreError::PartialWrite {
                    expected: data.len(),
                    actual: partial_len,
                });
            }
        }

        self.inner.append(data)
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        let mut s = self.state.lock();
        let s = &mut *s;
        s.stats.sync_attempts = s.stats.sync_attempts.saturating_add(1);

        if crate::buggify!(&mut s.rng, disk_faults::FSYNC_FAIL, self.config.fsync_fail_prob) {
            s.stats.sync_failures = s.stats.sync_failures.saturating_add(1);
            return Err(StoreError::FsyncFailed(
                "simulated fsync failure".to_string(),
            ));
        }

        self.inner.sync()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn truncate(&mut self, len: u64) -> Result<(), StoreError> {
        self.inner.truncate(len)
    }
}

impl<R: Rng + 'static> SegmentStore for SimulatedSegmentStore<R> {
    type Writer = SimulatedSegmentWriter<R>;
    type Reader = InMemorySegmentReader;
    type Guard = InMemoryGuard;

    fn create(&self, name: &str) -> Result<Self::Writer, StoreError> {
        let inner_writer = self.inner.create(name)?;
        Ok(SimulatedSegmentWriter {
            inner: inner_writer,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        })
    }

    fn open_append(&self, name: &str) -> Result<Self::Writer, StoreError> {
        Ok(SimulatedSegmentWriter {
            inner: self.inner.open_append(name)?,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, StoreError> {
        self.inner.open_read(name)
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list()
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(name)
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        self.inner.exists(name)
    }

    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.read_file(name)
    }

    fn write_file_atomic(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        {
            let mut s = self.state.lock();
            let s = &mut *s;
            if crate::buggify!(&mut s.rng, disk_faults::WRITE_FAIL, self.config.write_fail_prob) {
                s.stats.write_failures = s.stats.write_failures.saturating_add(1);
                return Err(StoreError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated metadata write failure",
                )));
            }
        }
        self.inner.write_file_atomic(name, data)
    }

    fn acquire(&self) -> Result<Self::Guard, StoreError> {
        self.inner.acquire()
    }
}
