//! Operation Queue
//!
//! Append-only, versioned log of operations for one queue directory.
//!
//! ```text
//!  put(op) ──► data-1.log   {"obj":…,"version":1} … {"obj":…,"version":57}
//!              data-58.log  {"obj":…,"version":58} …        ◄── active
//!              last_put_version = 63
//!              last_ack_version = 40    ◄── ack(v)
//! ```
//!
//! Versions are assigned under the writer lock, so they follow producer-call
//! order. A segment is sealed when it reaches `max_segment_size`; sealed
//! segments whose whole range is acknowledged are deleted by `ack`.
//!
//! Readers never see bytes of the active segment past the last complete
//! append, so a failed (and rolled back) write is invisible to them.
//!
//! `last_put_version` is written after the records it counts have been
//! synced (or, under `FsyncPolicy::No`, when a segment is sealed and when the
//! queue is dropped), never ahead of them.
//!
//! ## Recovery
//!
//! The segments are the source of truth. `last_put_version` is recovered as
//! the last complete record on disk (records appended by hand while the
//! owner was offline count), raised to `last_ack_version` if that is higher.
//! A version file claiming more than that is lowered. A torn record at the
//! end of the newest segment is truncated away, and segments left holding no
//! record are removed. The first put after opening always starts a new
//! segment.

use crate::config::{FsyncPolicy, QueueConfig};
use crate::queue::codec::{self, CodecError};
use crate::queue::metadata::{
    read_checkpoint, read_version, write_checkpoint, write_version, AckCheckpoint,
    LAST_ACK_VERSION_FILE, LAST_PUT_VERSION_FILE,
};
use crate::queue::operation::{Operation, QueuedOperation};
use crate::queue::segment::{list_segments, next_segment, segment_file_name};
use crate::queue::splitter::{RecordSplitter, SplitterError};
use crate::queue::store::{SegmentStore, SegmentWriter, StoreError};
use parking_lot::Mutex;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Error type for queue operations
#[derive(Debug)]
pub enum QueueError {
    /// Underlying storage failed
    Store(StoreError),
    /// A record could not be encoded, or stored bytes do not decode
    Codec(CodecError),
    /// Another owner holds the queue directory
    QueueLocked(String),
    /// Acknowledging a version that was never put
    AckBeyondPut { version: u64, last_put: u64 },
    /// The version counter is exhausted
    VersionOverflow,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Store(e) => write!(f, "{}", e),
            QueueError::Codec(e) => write!(f, "{}", e),
            QueueError::QueueLocked(owner) => {
                write!(f, "Queue is owned by another process: {}", owner)
            }
            QueueError::AckBeyondPut { version, last_put } => write!(
                f,
                "Cannot acknowledge version {}: last put version is {}",
                version, last_put
            ),
            QueueError::VersionOverflow => write!(f, "Queue version counter overflow"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Locked(owner) => QueueError::QueueLocked(owner),
            other => QueueError::Store(other),
        }
    }
}

impl From<CodecError> for QueueError {
    fn from(e: CodecError) -> Self {
        QueueError::Codec(e)
    }
}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        QueueError::Store(StoreError::from(e))
    }
}

impl From<SplitterError> for QueueError {
    fn from(e: SplitterError) -> Self {
        match e {
            SplitterError::Io(e) => QueueError::from(e),
            SplitterError::Codec(e) => QueueError::Codec(e),
        }
    }
}

/// Snapshot of queue progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub pending_count: u64,
    pub last_acked_version: u64,
    pub last_put_version: u64,
}

struct ActiveSegment<W> {
    first_version: u64,
    writer: W,
}

struct WriterState<W> {
    active: Option<ActiveSegment<W>>,
    last_sync: Instant,
    unsynced: bool,
    /// Value last written to the version file
    recorded_put: u64,
    /// Highest version whose record is known to be synced
    synced_put: u64,
}

struct QueueShared<S: SegmentStore> {
    store: S,
    config: QueueConfig,
    writer: Mutex<WriterState<S::Writer>>,
    /// (active segment, bytes readers may see)
    committed: Mutex<Option<(u64, u64)>>,
    ack_lock: Mutex<()>,
    last_put: AtomicU64,
    last_ack: AtomicU64,
    data_ready: Notify,
    ack_tx: watch::Sender<u64>,
    _guard: S::Guard,
}

impl<S: SegmentStore> QueueShared<S> {
    /// Readable length of `segment`; `None` when it is not the active one
    fn committed_len(&self, segment: u64) -> Option<u64> {
        match *self.committed.lock() {
            Some((active, len)) if active == segment => Some(len),
            _ => None,
        }
    }

    /// Sync the active segment, then record `last_put_version`
    fn sync_writer(&self, state: &mut WriterState<S::Writer>) -> Result<(), QueueError> {
        let last_put = self.last_put.load(Ordering::Acquire);
        if let Some(active) = state.active.as_mut() {
            active.writer.sync()?;
        }
        state.unsynced = false;
        state.last_sync = Instant::now();
        state.synced_put = state.synced_put.max(last_put);
        self.record_put(state, last_put)
    }

    fn record_put(&self, state: &mut WriterState<S::Writer>, last_put: u64) -> Result<(), QueueError> {
        if last_put > state.recorded_put {
            write_version(&self.store, LAST_PUT_VERSION_FILE, last_put)?;
            state.recorded_put = last_put;
        }
        Ok(())
    }
}

impl<S: SegmentStore> Drop for QueueShared<S> {
    fn drop(&mut self) {
        // Best-effort; nobody is left to report to
        let mut state = self.writer.lock();
        if self.config.fsync_policy == FsyncPolicy::No {
            let last_put = self.last_put.load(Ordering::Acquire);
            let _ = self.record_put(&mut state, last_put);
        } else if state.unsynced {
            let _ = self.sync_writer(&mut state);
        }
    }
}

/// Versioned on-disk operation queue. Cloning yields another handle to the
/// same queue.
pub struct OperationQueue<S: SegmentStore> {
    shared: Arc<QueueShared<S>>,
}

impl<S: SegmentStore> Clone for OperationQueue<S> {
    fn clone(&self) -> Self {
        OperationQueue {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: SegmentStore> OperationQueue<S> {
    /// Take ownership of the directory behind `store` and recover its state.
    pub fn open(store: S, config: QueueConfig) -> Result<Self, QueueError> {
        debug_assert!(
            config.max_segment_size > 0,
            "Precondition: max_segment_size must be positive"
        );

        let guard = store.acquire()?;

        let file_put = read_version(&store, LAST_PUT_VERSION_FILE)?.unwrap_or(0);
        let last_ack = read_version(&store, LAST_ACK_VERSION_FILE)?.unwrap_or(0);
        let segments = list_segments(&store)?;
        let tail = scan_tail(&store, &segments)?;

        if let Some((segment, keep)) = tail.torn {
            let mut writer = store.open_append(&segment_file_name(segment))?;
            let dropped = writer.size().saturating_sub(keep);
            writer.truncate(keep)?;
            if config.fsync_policy != FsyncPolicy::No {
                writer.sync()?;
            }
            warn!(segment, keep, dropped, "Truncated torn record at end of segment");
        }

        let tail_put = tail.last_version.unwrap_or(0);
        // An acknowledged record can be missing when it was delivered before
        // an fsync that never happened. Its version stays used.
        if last_ack > tail_put {
            warn!(
                last_ack,
                last_put = tail_put,
                "Acknowledged version ahead of stored records"
            );
        }
        let last_put = tail_put.max(last_ack);

        // Segments newer than every surviving record hold nothing readable
        for &segment in segments.iter().filter(|&&s| s > last_put) {
            store.delete(&segment_file_name(segment))?;
            debug!(segment, "Removed segment without records");
        }

        if last_put != file_put {
            if file_put > last_put {
                warn!(
                    recorded = file_put,
                    recovered = last_put,
                    "last_put_version ahead of stored records, lowering it"
                );
            } else {
                info!(
                    recorded = file_put,
                    recovered = last_put,
                    "Recovered records beyond last_put_version"
                );
            }
            write_version(&store, LAST_PUT_VERSION_FILE, last_put)?;
        }

        let (ack_tx, _) = watch::channel(last_ack);
        let queue = OperationQueue {
            shared: Arc::new(QueueShared {
                store,
                config,
                writer: Mutex::new(WriterState {
                    active: None,
                    last_sync: Instant::now(),
                    unsynced: false,
                    recorded_put: last_put,
                    synced_put: last_put,
                }),
                committed: Mutex::new(None),
                ack_lock: Mutex::new(()),
                last_put: AtomicU64::new(last_put),
                last_ack: AtomicU64::new(last_ack),
                data_ready: Notify::new(),
                ack_tx,
                _guard: guard,
            }),
        };

        info!(
            last_put,
            last_ack,
            segments = segments.len(),
            "Opened operation queue"
        );
        queue.verify_invariants();
        Ok(queue)
    }

    /// Append one operation; returns its version.
    ///
    /// If the append itself fails, nothing is consumed and the segment is
    /// rolled back. If the append succeeds but the following fsync or
    /// version-file write fails, the version is consumed (the record may
    /// still be delivered) and the error is returned.
    pub fn put(&self, op: Operation) -> Result<u64, QueueError> {
        let shared = &*self.shared;
        let mut state = shared.writer.lock();

        let version = shared
            .last_put
            .load(Ordering::Acquire)
            .checked_add(1)
            .ok_or(QueueError::VersionOverflow)?;
        let record = codec::encode(&QueuedOperation::new(op, version))?;

        let rotate = state.active.as_ref().is_some_and(|a| {
            let size = a.writer.size();
            size > 0 && size.saturating_add(record.len() as u64) > shared.config.max_segment_size
        });
        if rotate {
            self.seal_active(&mut state)?;
        }

        let active = match &mut state.active {
            Some(active) => active,
            slot => {
                let name = segment_file_name(version);
                let writer = shared.store.create(&name)?;
                *shared.committed.lock() = Some((version, 0));
                debug!(segment = %name, "Started segment");
                slot.insert(ActiveSegment {
                    first_version: version,
                    writer,
                })
            }
        };

        let before = active.writer.size();
        if let Err(e) = active.writer.append(&record) {
            warn!(version, error = %e, "Append failed, rolling back");
            if let Err(te) = active.writer.truncate(before) {
                error!(
                    segment = active.first_version,
                    error = %te,
                    "Rollback failed, sealing segment"
                );
                state.active = None;
                *shared.committed.lock() = None;
            }
            return Err(e.into());
        }
        let size = active.writer.size();
        let segment = active.first_version;

        // Order matters: a reader that sees the bytes may ack the version
        shared.last_put.store(version, Ordering::Release);
        *shared.committed.lock() = Some((segment, size));
        shared.data_ready.notify_one();

        state.unsynced = true;
        match shared.config.fsync_policy {
            FsyncPolicy::Always => shared.sync_writer(&mut state)?,
            FsyncPolicy::EverySecond => {
                if state.last_sync.elapsed() >= shared.config.fsync_interval {
                    shared.sync_writer(&mut state)?;
                }
            }
            FsyncPolicy::No => {}
        }

        debug_assert!(
            shared.last_put.load(Ordering::Acquire) == version,
            "Postcondition: last_put must equal the assigned version"
        );
        Ok(version)
    }

    fn seal_active(&self, state: &mut WriterState<S::Writer>) -> Result<(), QueueError> {
        let shared = &*self.shared;
        if state.active.is_some() {
            if shared.config.fsync_policy == FsyncPolicy::No {
                let last_put = shared.last_put.load(Ordering::Acquire);
                shared.record_put(state, last_put)?;
            } else {
                shared.sync_writer(state)?;
            }
        }
        if let Some(sealed) = state.active.take() {
            *shared.committed.lock() = None;
            info!(
                segment = sealed.first_version,
                size = sealed.writer.size(),
                "Sealed segment"
            );
        }
        Ok(())
    }

    /// Force appended records to stable storage
    pub fn sync(&self) -> Result<(), QueueError> {
        let mut state = self.shared.writer.lock();
        if state.unsynced {
            self.shared.sync_writer(&mut state)?;
        }
        Ok(())
    }

    /// Sync if `FsyncPolicy::EverySecond` is due. Called from idle paths so
    /// the last puts of a burst do not wait for the next put.
    pub fn sync_if_due(&self) -> Result<(), QueueError> {
        if self.shared.config.fsync_policy != FsyncPolicy::EverySecond {
            return Ok(());
        }
        let mut state = self.shared.writer.lock();
        if state.unsynced && state.last_sync.elapsed() >= self.shared.config.fsync_interval {
            self.shared.sync_writer(&mut state)?;
        }
        Ok(())
    }

    /// Record that every version up to and including `version` is confirmed.
    /// Lower or equal versions are a no-op.
    pub fn ack(&self, version: u64) -> Result<(), QueueError> {
        self.ack_inner(version, None)
    }

    /// `ack` that also persists the reader position for fast resume
    pub fn ack_with_checkpoint(&self, checkpoint: AckCheckpoint) -> Result<(), QueueError> {
        self.ack_inner(checkpoint.version, Some(checkpoint))
    }

    fn ack_inner(&self, version: u64, checkpoint: Option<AckCheckpoint>) -> Result<(), QueueError> {
        let shared = &*self.shared;
        let _ack = shared.ack_lock.lock();

        let current = shared.last_ack.load(Ordering::Acquire);
        if version <= current {
            return Ok(());
        }
        let last_put = shared.last_put.load(Ordering::Acquire);
        if version > last_put {
            return Err(QueueError::AckBeyondPut { version, last_put });
        }

        // The checkpoint only matches an ack of the same version, so a
        // checkpoint without its ack is ignored by readers
        if let Some(checkpoint) = checkpoint {
            if let Err(e) = write_checkpoint(&shared.store, &checkpoint) {
                warn!(version, error = %e, "Failed to persist ack checkpoint");
            }
        }
        write_version(&shared.store, LAST_ACK_VERSION_FILE, version)?;
        shared.last_ack.store(version, Ordering::Release);
        shared.ack_tx.send_replace(version);

        if let Err(e) = self.delete_acked_segments(version) {
            warn!(version, error = %e, "Failed to delete acknowledged segments");
        }

        self.verify_invariants();
        Ok(())
    }

    /// Delete sealed segments whose every version is `<= version`
    fn delete_acked_segments(&self, version: u64) -> Result<(), QueueError> {
        let shared = &*self.shared;
        let active = shared
            .writer
            .lock()
            .active
            .as_ref()
            .map(|a| a.first_version);
        let segments = list_segments(&shared.store)?;
        let bound = version.saturating_add(1);

        for pair in segments.windows(2) {
            let (segment, next) = (pair[0], pair[1]);
            if next > bound {
                break;
            }
            if Some(segment) == active {
                continue;
            }
            shared.store.delete(&segment_file_name(segment))?;
            debug!(segment, acked = version, "Deleted acknowledged segment");
        }
        Ok(())
    }

    /// Lazy reader over operations with version > `version`
    pub fn read_from(&self, version: u64) -> Result<QueueReader<S>, QueueError> {
        let mut reader = QueueReader {
            shared: Arc::clone(&self.shared),
            cursor: version,
            current: None,
        };

        let checkpoint = match read_checkpoint(&self.shared.store) {
            Ok(cp) => cp.filter(|cp| version > 0 && cp.version == version),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable ack checkpoint");
                None
            }
        };
        if let Some(cp) = checkpoint {
            reader.current = reader.open_at(cp.segment, cp.offset)?;
            if reader.current.is_some() {
                debug!(segment = cp.segment, offset = cp.offset, version, "Resuming from checkpoint");
            }
        }
        Ok(reader)
    }

    pub fn status(&self) -> QueueStatus {
        let last_acked_version = self.shared.last_ack.load(Ordering::Acquire);
        let last_put_version = self.shared.last_put.load(Ordering::Acquire);
        QueueStatus {
            pending_count: last_put_version.saturating_sub(last_acked_version),
            last_acked_version,
            last_put_version,
        }
    }

    pub fn last_put_version(&self) -> u64 {
        self.shared.last_put.load(Ordering::Acquire)
    }

    pub fn last_acked_version(&self) -> u64 {
        self.shared.last_ack.load(Ordering::Acquire)
    }

    /// Highest version whose record has been synced by this handle (or was
    /// recovered at open)
    pub fn synced_version(&self) -> u64 {
        self.shared.writer.lock().synced_put
    }

    /// Resolves after the next put (or immediately if one happened since
    /// the last wait).
    pub async fn wait_for_put(&self) {
        self.shared.data_ready.notified().await;
    }

    /// Watch channel carrying `last_acked_version`
    pub fn subscribe_acks(&self) -> watch::Receiver<u64> {
        self.shared.ack_tx.subscribe()
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// TigerStyle: verify internal invariants
    pub fn verify_invariants(&self) {
        debug_assert!(
            self.shared.last_ack.load(Ordering::Acquire)
                <= self.shared.last_put.load(Ordering::Acquire),
            "Invariant: last_ack_version <= last_put_version"
        );
    }
}

/// `(last_put, last_ack)` as `open` would recover them, without taking
/// ownership or writing anything.
pub(crate) fn persisted_versions<S: SegmentStore>(store: &S) -> Result<(u64, u64), QueueError> {
    // The version file is validated even though the segments decide
    read_version(store, LAST_PUT_VERSION_FILE)?;
    let last_ack = read_version(store, LAST_ACK_VERSION_FILE)?.unwrap_or(0);
    let tail = scan_tail(store, &list_segments(store)?)?;
    Ok((tail.last_version.unwrap_or(0).max(last_ack), last_ack))
}

/// What the end of a queue's segments holds
#[derive(Debug, Default)]
struct SegmentTail {
    /// Version of the last complete record in the newest segment that has one
    last_version: Option<u64>,
    /// `(segment, length to keep)` when the newest segment ends mid-record
    torn: Option<(u64, u64)>,
}

fn scan_tail<S: SegmentStore>(store: &S, segments: &[u64]) -> Result<SegmentTail, QueueError> {
    let mut tail = SegmentTail::default();
    for (i, &segment) in segments.iter().enumerate().rev() {
        let Some(scan) = scan_segment(store, segment)? else {
            continue;
        };
        if i + 1 == segments.len() && scan.pending > 0 {
            tail.torn = Some((segment, scan.complete_len));
        }
        if scan.last_version.is_some() {
            tail.last_version = scan.last_version;
            break;
        }
    }
    Ok(tail)
}

struct SegmentScan {
    last_version: Option<u64>,
    /// Bytes up to and including the last complete record
    complete_len: u64,
    /// Bytes after it that do not form a record
    pending: usize,
}

fn scan_segment<S: SegmentStore>(store: &S, segment: u64) -> Result<Option<SegmentScan>, QueueError> {
    let name = segment_file_name(segment);
    let reader = match store.open_read(&name) {
        Ok(reader) => reader,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut splitter = RecordSplitter::new(reader);
    let mut last_version = None;
    while let Some(record) = splitter.get::<QueuedOperation>()? {
        last_version = Some(last_version.map_or(record.version, |v: u64| v.max(record.version)));
    }
    if splitter.pending_bytes() > 0 {
        warn!(
            segment = %name,
            bytes = splitter.pending_bytes(),
            "Segment ends with an incomplete record"
        );
    }
    Ok(Some(SegmentScan {
        last_version,
        complete_len: splitter.position(),
        pending: splitter.pending_bytes(),
    }))
}

/// Segment reader that stops at the committed length of the active segment
struct CommittedReader<S: SegmentStore> {
    shared: Arc<QueueShared<S>>,
    segment: u64,
    inner: S::Reader,
    pos: u64,
}

impl<S: SegmentStore> Read for CommittedReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let buf = match self.shared.committed_len(self.segment) {
            Some(limit) => {
                let available = limit.saturating_sub(self.pos);
                if available == 0 {
                    return Ok(0);
                }
                let n = buf.len().min(usize::try_from(available).unwrap_or(usize::MAX));
                &mut buf[..n]
            }
            None => buf,
        };
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: SegmentStore> Seek for CommittedReader<S> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.pos = self.inner.seek(pos)?;
        Ok(self.pos)
    }
}

struct OpenSegment<S: SegmentStore> {
    first_version: u64,
    splitter: RecordSplitter<CommittedReader<S>>,
    /// Following segment, once seen; this one is sealed from then on
    next: Option<u64>,
}

/// Lazy, restartable reader produced by `OperationQueue::read_from`
pub struct QueueReader<S: SegmentStore> {
    shared: Arc<QueueShared<S>>,
    cursor: u64,
    current: Option<OpenSegment<S>>,
}

impl<S: SegmentStore> QueueReader<S> {
    /// Next operation after the cursor, or `None` when nothing more is
    /// available yet. Call again later to pick up new puts.
    pub fn next_operation(&mut self) -> Result<Option<QueuedOperation>, QueueError> {
        loop {
            if self.current.is_none() && !self.open_for_cursor()? {
                return Ok(None);
            }
            let Some(seg) = self.current.as_mut() else {
                return Ok(None);
            };

            match seg.splitter.get::<QueuedOperation>()? {
                Some(record) if record.version <= self.cursor => {
                    // Already delivered
                    continue;
                }
                Some(record) => {
                    if let Some(next) = seg.next.filter(|&next| record.version >= next) {
                        warn!(
                            segment = seg.first_version,
                            version = record.version,
                            "Ignoring record superseded by segment {}", next
                        );
                        self.current = self.open_at(next, 0)?;
                        continue;
                    }
                    self.cursor = record.version;
                    return Ok(Some(record));
                }
                None => {
                    let next = match seg.next {
                        Some(next) => next,
                        None => match next_segment(&self.shared.store, seg.first_version)? {
                            Some(next) => {
                                // Sealed now; drain anything written before rotation
                                seg.next = Some(next);
                                continue;
                            }
                            None => return Ok(None),
                        },
                    };
                    if seg.splitter.pending_bytes() > 0 {
                        warn!(
                            segment = seg.first_version,
                            bytes = seg.splitter.pending_bytes(),
                            "Skipping truncated record at end of sealed segment"
                        );
                    }
                    self.current = self.open_at(next, 0)?;
                }
            }
        }
    }

    /// Version of the last operation returned (or the starting version)
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Resume point just past the last returned operation
    pub fn checkpoint(&self) -> Option<AckCheckpoint> {
        if self.cursor == 0 {
            return None;
        }
        self.current.as_ref().map(|seg| AckCheckpoint {
            segment: seg.first_version,
            offset: seg.splitter.position(),
            version: self.cursor,
        })
    }

    /// Open the segment that must contain `cursor + 1`
    fn open_for_cursor(&mut self) -> Result<bool, QueueError> {
        let segments = list_segments(&self.shared.store)?;
        let wanted = self.cursor.saturating_add(1);
        let target = segments
            .iter()
            .rev()
            .find(|&&s| s <= wanted)
            .or_else(|| segments.first())
            .copied();
        let Some(target) = target else {
            return Ok(false);
        };
        self.current = self.open_at(target, 0)?;
        Ok(self.current.is_some())
    }

    fn open_at(&self, segment: u64, offset: u64) -> Result<Option<OpenSegment<S>>, QueueError> {
        let inner = match self.shared.store.open_read(&segment_file_name(segment)) {
            Ok(inner) => inner,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = CommittedReader {
            shared: Arc::clone(&self.shared),
            segment,
            inner,
            pos: 0,
        };

        let splitter = if offset == 0 {
            RecordSplitter::new(reader)
        } else {
            let len = reader.inner.seek(SeekFrom::End(0))?;
            reader.inner.seek(SeekFrom::Start(0))?;
            if offset > len {
                warn!(segment, offset, len, "Checkpoint past end of segment, rescanning");
                RecordSplitter::new(reader)
            } else {
                RecordSplitter::at_offset(reader, offset)?
            }
        };

        Ok(Some(OpenSegment {
            first_version: segment,
            splitter,
            next: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulation::SimulatedRng;
    use crate::queue::operation::parse_path;
    use crate::queue::store::{
        InMemorySegmentStore, LocalSegmentStore, SimulatedSegmentStore, SimulatedStoreConfig,
    };

    fn assign(value: i64) -> Operation {
        Operation::AssignInt {
            path: parse_path("a"),
            value,
        }
    }

    fn value_of(record: &QueuedOperation) -> i64 {
        match record.obj {
            Operation::AssignInt { value, .. } => value,
            ref other => panic!("unexpected {:?}", other),
        }
    }

    fn drain<S: SegmentStore>(reader: &mut QueueReader<S>) -> Vec<QueuedOperation> {
        let mut out = Vec::new();
        while let Some(record) = reader.next_operation().unwrap() {
            out.push(record);
        }
        out
    }

    fn open(store: &InMemorySegmentStore) -> OperationQueue<InMemorySegmentStore> {
        OperationQueue::open(store.clone(), QueueConfig::test()).unwrap()
    }

    #[test]
    fn test_put_read_in_order() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);

        for i in 0..20 {
            assert_eq!(queue.put(assign(i)).unwrap(), i as u64 + 1);
        }

        let records = drain(&mut queue.read_from(0).unwrap());
        let versions: Vec<u64> = records.iter().map(|r| r.version).collect();
        assert_eq!(versions, (1..=20).collect::<Vec<_>>());
        assert_eq!(
            records.iter().map(value_of).collect::<Vec<_>>(),
            (0..20).collect::<Vec<_>>()
        );
        assert_eq!(
            store.get_file_data(LAST_PUT_VERSION_FILE).unwrap(),
            b"20".to_vec()
        );
    }

    #[test]
    fn test_read_from_skips_prefix() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);
        for i in 0..5 {
            queue.put(assign(i)).unwrap();
        }
        let records = drain(&mut queue.read_from(3).unwrap());
        assert_eq!(records.iter().map(|r| r.version).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_reader_sees_later_puts() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);
        let mut reader = queue.read_from(0).unwrap();
        assert!(reader.next_operation().unwrap().is_none());

        queue.put(assign(1)).unwrap();
        assert_eq!(reader.next_operation().unwrap().unwrap().version, 1);
        assert!(reader.next_operation().unwrap().is_none());

        queue.put(assign(2)).unwrap();
        assert_eq!(reader.next_operation().unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_ack_is_idempotent_and_monotonic() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);
        for i in 0..5 {
            queue.put(assign(i)).unwrap();
        }

        queue.ack(3).unwrap();
        queue.ack(3).unwrap();
        queue.ack(1).unwrap();
        assert_eq!(queue.last_acked_version(), 3);
        assert_eq!(
            store.get_file_data(LAST_ACK_VERSION_FILE).unwrap(),
            b"3".to_vec()
        );

        assert!(matches!(
            queue.ack(6),
            Err(QueueError::AckBeyondPut {
                version: 6,
                last_put: 5
            })
        ));
        assert_eq!(queue.last_acked_version(), 3);

        let status = queue.status();
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.last_put_version, 5);
    }

    #[test]
    fn test_rotation_and_acked_segment_deletion() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);
        for i in 0..100 {
            queue.put(assign(i)).unwrap();
        }
        let segments = list_segments(&store).unwrap();
        assert!(segments.len() > 3, "expected rotation, got {:?}", segments);

        let records = drain(&mut queue.read_from(0).unwrap());
        assert_eq!(records.len(), 100);

        // Everything in the first two segments is acknowledged
        let ack_to = segments[2] - 1;
        queue.ack(ack_to).unwrap();
        let remaining = list_segments(&store).unwrap();
        assert_eq!(remaining[0], segments[2]);

        let rest = drain(&mut queue.read_from(ack_to).unwrap());
        assert_eq!(rest.first().unwrap().version, ack_to + 1);
        assert_eq!(rest.len() as u64, 100 - ack_to);

        queue.ack(100).unwrap();
        assert_eq!(list_segments(&store).unwrap().len(), 1, "active segment stays");
    }

    #[test]
    fn test_reopen_recovers_state() {
        let store = InMemorySegmentStore::new();
        {
            let queue = open(&store);
            for i in 0..10 {
                queue.put(assign(i)).unwrap();
            }
            queue.ack(4).unwrap();
        }
        let queue = open(&store);
        assert_eq!(
            queue.status(),
            QueueStatus {
                pending_count: 6,
                last_acked_version: 4,
                last_put_version: 10,
            }
        );
        assert_eq!(queue.put(assign(10)).unwrap(), 11);
        let records = drain(&mut queue.read_from(4).unwrap());
        assert_eq!(
            records.iter().map(|r| r.version).collect::<Vec<_>>(),
            (5..=11).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_second_owner_is_rejected() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);
        assert!(matches!(
            OperationQueue::open(store.clone(), QueueConfig::test()),
            Err(QueueError::QueueLocked(_))
        ));
        drop(queue);
        assert!(OperationQueue::open(store, QueueConfig::test()).is_ok());
    }

    #[test]
    fn test_recovers_records_past_version_file() {
        let store = InMemorySegmentStore::new();
        {
            let queue = open(&store);
            queue.put(assign(1)).unwrap();
            queue.put(assign(2)).unwrap();
        }
        // Appended while the owner was offline, no newline between records
        let extra = r#"{"obj": {"type": "AssignInt", "path": ["a"], "value": 3}, "version": 3}{"obj": {"type": "AssignInt", "path": ["a"], "value": 4}, "version": 4}"#;
        store.append_raw(&segment_file_name(1), extra.as_bytes());

        let queue = open(&store);
        assert_eq!(queue.last_put_version(), 4);
        let records = drain(&mut queue.read_from(0).unwrap());
        assert_eq!(records.iter().map(value_of).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(queue.put(assign(5)).unwrap(), 5);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let store = InMemorySegmentStore::new();
        {
            let queue = open(&store);
            queue.put(assign(1)).unwrap();
            queue.put(assign(2)).unwrap();
        }
        let name = segment_file_name(1);
        let full = store.get_file_data(&name).unwrap();
        let first_len = codec::encode(&QueuedOperation::new(assign(1), 1)).unwrap().len();
        store.truncate_file(&name, full.len() - 10);

        let queue = open(&store);
        assert_eq!(store.get_file_data(&name).unwrap().len(), first_len);
        assert_eq!(queue.last_put_version(), 1, "torn record 2 never counted");
        assert_eq!(store.get_file_data(LAST_PUT_VERSION_FILE).unwrap(), b"1".to_vec());
        assert_eq!(queue.put(assign(3)).unwrap(), 2);

        let records = drain(&mut queue.read_from(0).unwrap());
        assert_eq!(records.iter().map(|r| r.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(records.iter().map(value_of).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_unsynced_puts_do_not_outlive_a_crash() {
        let store = InMemorySegmentStore::new();
        let config = QueueConfig {
            fsync_policy: FsyncPolicy::EverySecond,
            fsync_interval: std::time::Duration::from_secs(60),
            ..QueueConfig::test()
        };
        let queue = OperationQueue::open(store.clone(), config.clone()).unwrap();
        queue.put(assign(1)).unwrap();
        queue.put(assign(2)).unwrap();
        assert_eq!(queue.synced_version(), 0);
        assert_eq!(store.get_file_data(LAST_PUT_VERSION_FILE), None);
        // Process dies without running Drop
        std::mem::forget(queue);
        store.simulate_crash();

        let queue = OperationQueue::open(store.clone(), config).unwrap();
        assert_eq!(
            queue.status(),
            QueueStatus {
                pending_count: 0,
                last_acked_version: 0,
                last_put_version: 0,
            }
        );
        assert!(drain(&mut queue.read_from(0).unwrap()).is_empty());
        assert_eq!(queue.put(assign(9)).unwrap(), 1);
    }

    #[test]
    fn test_version_file_written_after_sync() {
        let store = InMemorySegmentStore::new();
        let config = QueueConfig {
            fsync_policy: FsyncPolicy::EverySecond,
            fsync_interval: std::time::Duration::from_secs(60),
            ..QueueConfig::test()
        };
        let queue = OperationQueue::open(store.clone(), config).unwrap();
        queue.put(assign(1)).unwrap();
        queue.put(assign(2)).unwrap();
        assert_eq!(store.get_file_data(LAST_PUT_VERSION_FILE), None);

        queue.sync().unwrap();
        assert_eq!(queue.synced_version(), 2);
        assert_eq!(store.get_file_data(LAST_PUT_VERSION_FILE).unwrap(), b"2".to_vec());

        queue.put(assign(3)).unwrap();
        store.simulate_crash();
        assert_eq!(persisted_versions(&store).unwrap(), (2, 0));
    }

    #[test]
    fn test_version_file_ahead_of_records_is_lowered() {
        let store = InMemorySegmentStore::new();
        {
            let queue = open(&store);
            queue.put(assign(1)).unwrap();
            queue.ack(1).unwrap();
            queue.put(assign(2)).unwrap();
        }
        store.write_file_atomic(LAST_PUT_VERSION_FILE, b"7").unwrap();
        assert_eq!(persisted_versions(&store).unwrap(), (2, 1));

        let queue = open(&store);
        assert_eq!(queue.status().pending_count, 1);
        assert_eq!(store.get_file_data(LAST_PUT_VERSION_FILE).unwrap(), b"2".to_vec());
        assert_eq!(queue.put(assign(3)).unwrap(), 3);
    }

    #[test]
    fn test_no_fsync_policy_records_version_on_drop() {
        let store = InMemorySegmentStore::new();
        let config = QueueConfig {
            fsync_policy: FsyncPolicy::No,
            ..QueueConfig::test()
        };
        {
            let queue = OperationQueue::open(store.clone(), config.clone()).unwrap();
            for i in 0..3 {
                queue.put(assign(i)).unwrap();
            }
            assert_eq!(store.get_file_data(LAST_PUT_VERSION_FILE), None);
        }
        assert_eq!(store.get_file_data(LAST_PUT_VERSION_FILE).unwrap(), b"3".to_vec());
        let queue = OperationQueue::open(store, config).unwrap();
        assert_eq!(queue.last_put_version(), 3);
    }

    #[test]
    fn test_malformed_record_halts_reading() {
        let store = InMemorySegmentStore::new();
        {
            let queue = open(&store);
            queue.put(assign(1)).unwrap();
        }
        store.append_raw(&segment_file_name(1), b"{\"obj\": 12, \"version\": 2}\n");
        assert!(matches!(
            OperationQueue::open(store.clone(), QueueConfig::test()),
            Err(QueueError::Codec(CodecError::MalformedRecord(_)))
        ));
    }

    #[test]
    fn test_checkpoint_resume() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);
        for i in 0..6 {
            queue.put(assign(i)).unwrap();
        }
        let mut reader = queue.read_from(0).unwrap();
        for _ in 0..3 {
            reader.next_operation().unwrap();
        }
        let cp = reader.checkpoint().unwrap();
        assert_eq!(cp.version, 3);
        queue.ack_with_checkpoint(cp).unwrap();

        let mut resumed = queue.read_from(3).unwrap();
        let first = resumed.next_operation().unwrap().unwrap();
        assert_eq!(first.version, 4);
        assert_eq!(drain(&mut resumed).len(), 2);
    }

    #[test]
    fn test_stale_checkpoint_past_end_is_ignored() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);
        queue.put(assign(1)).unwrap();
        queue.put(assign(2)).unwrap();
        queue
            .ack_with_checkpoint(AckCheckpoint {
                segment: 1,
                offset: 1_000_000,
                version: 1,
            })
            .unwrap();
        let records = drain(&mut queue.read_from(1).unwrap());
        assert_eq!(records.iter().map(|r| r.version).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let store = SimulatedSegmentStore::new(
            SimulatedRng::new(3),
            SimulatedStoreConfig {
                partial_write_prob: 1.0,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let inner = store.inner_store().clone();
        {
            let queue = OperationQueue::open(store, QueueConfig::test()).unwrap();
            assert!(matches!(
                queue.put(assign(1)),
                Err(QueueError::Store(StoreError::PartialWrite { .. }))
            ));
            assert_eq!(queue.last_put_version(), 0);
        }
        assert_eq!(inner.get_file_data(&segment_file_name(1)).unwrap(), b"");

        let queue = OperationQueue::open(inner, QueueConfig::test()).unwrap();
        assert_eq!(queue.put(assign(7)).unwrap(), 1);
        let records = drain(&mut queue.read_from(0).unwrap());
        assert_eq!(records.iter().map(value_of).collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_local_store_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec-1");
        {
            let queue =
                OperationQueue::open(LocalSegmentStore::new(path.clone()).unwrap(), QueueConfig::test())
                    .unwrap();
            for i in 0..50 {
                queue.put(assign(i)).unwrap();
            }
            queue.ack(10).unwrap();
            assert!(matches!(
                OperationQueue::open(LocalSegmentStore::new(path.clone()).unwrap(), QueueConfig::test()),
                Err(QueueError::QueueLocked(_))
            ));
        }
        assert_eq!(std::fs::read_to_string(path.join("last_put_version")).unwrap(), "50");
        assert_eq!(std::fs::read_to_string(path.join("last_ack_version")).unwrap(), "10");

        let queue =
            OperationQueue::open(LocalSegmentStore::new(path).unwrap(), QueueConfig::test()).unwrap();
        let records = drain(&mut queue.read_from(10).unwrap());
        assert_eq!(records.len(), 40);
        assert_eq!(records[0].version, 11);
    }

    #[tokio::test]
    async fn test_wait_for_put_wakes() {
        let store = InMemorySegmentStore::new();
        let queue = open(&store);
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_put().await });
        tokio::task::yield_now().await;
        queue.put(assign(1)).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
