//! Reconciliation Scanner
//!
//! Works on queue directories left on disk, independent of the process that
//! wrote them:
//!
//! - `list_queues` finds every queue under a root and classifies it,
//!   reporting unreadable directories next to the readable ones;
//! - `sync` replays a queue against the backend with a fresh consumer;
//! - `delete` removes a queue directory, refusing unsynchronized ones unless
//!   forced.
//!
//! A queue whose directory lock is held by a live process is never synced
//! or deleted.

use crate::config::OpsyncConfig;
use crate::queue::consumer::{spawn_consumer, ConsumerError, RejectedOperation, RemoteSink};
use crate::queue::disk_queue::{persisted_versions, OperationQueue, QueueError};
use crate::queue::layout::{
    parse_container_dir_name, QueueMode, ASYNC_DIRECTORY, EXEC_PREFIX, OFFLINE_DIRECTORY,
};
use crate::queue::metadata::QueueMetadata;
use crate::queue::operation::ContainerType;
use crate::queue::store::{LocalSegmentStore, SegmentStore, StoreError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long `sync` waits for its consumer to exit once drained
const CONSUMER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    /// Every put has been acknowledged
    Synchronized,
    /// Pending operations for a container that has a remote id
    UnsynchronizedOnline,
    /// Pending operations recorded without a remote container
    UnsynchronizedOffline,
}

/// One queue directory found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub path: PathBuf,
    pub mode: QueueMode,
    pub container_type: ContainerType,
    /// Id from the directory name: remote id (async) or local id (offline)
    pub container_id: String,
    pub execution_id: Option<String>,
    pub metadata: Option<QueueMetadata>,
    pub last_put_version: u64,
    pub last_ack_version: u64,
    pub class: QueueClass,
}

impl QueueDescriptor {
    pub fn pending_count(&self) -> u64 {
        self.last_put_version.saturating_sub(self.last_ack_version)
    }

    pub fn is_synchronized(&self) -> bool {
        self.class == QueueClass::Synchronized
    }

    pub fn project(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.project.as_deref())
    }

    /// e.g. `run RUN-17 (exec 1718031100123-4242)` or `run 5c0f1e2a (offline)`
    pub fn display_name(&self) -> String {
        match (&self.mode, &self.execution_id) {
            (QueueMode::Async, Some(exec)) => {
                format!("{} {} (exec {})", self.container_type, self.container_id, exec)
            }
            (QueueMode::Async, None) => format!("{} {}", self.container_type, self.container_id),
            (QueueMode::Offline, _) => {
                format!("{} {} (offline)", self.container_type, self.container_id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Only delete queues with nothing pending
    RequireSynchronized,
    /// Delete regardless; pending operations are lost
    Force,
}

/// Backend access needed to replay queues
pub trait SyncBackend: Send + Sync {
    /// Sink that applies operations to the given remote container
    fn sink_for<'a>(
        &'a self,
        container_type: ContainerType,
        container_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RemoteSink>, String>> + Send + 'a>>;

    /// Create a remote container for an offline queue; returns its id
    fn register_offline<'a>(
        &'a self,
        container_type: ContainerType,
        project: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;
}

#[derive(Debug)]
pub enum ReconcileError {
    /// Refused to delete a queue that still has pending operations
    NotSynchronized { path: PathBuf, pending: u64 },
    /// Offline queue without a project to register it under
    MissingProject(PathBuf),
    Queue(QueueError),
    Backend(String),
    /// Consumer did not catch up within the sync timeout
    Timeout { path: PathBuf, pending: u64 },
    /// Consumer stopped before catching up
    Consumer(ConsumerError),
    Io(std::io::Error),
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::NotSynchronized { path, pending } => write!(
                f,
                "{} has {} unsynchronized operations",
                path.display(),
                pending
            ),
            ReconcileError::MissingProject(path) => write!(
                f,
                "{} was recorded offline without a project; a project is required to sync it",
                path.display()
            ),
            ReconcileError::Queue(e) => write!(f, "{}", e),
            ReconcileError::Backend(msg) => write!(f, "Backend error: {}", msg),
            ReconcileError::Timeout { path, pending } => write!(
                f,
                "Timed out syncing {} with {} operations pending",
                path.display(),
                pending
            ),
            ReconcileError::Consumer(e) => write!(f, "{}", e),
            ReconcileError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<QueueError> for ReconcileError {
    fn from(e: QueueError) -> Self {
        ReconcileError::Queue(e)
    }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        ReconcileError::Queue(QueueError::from(e))
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(e: std::io::Error) -> Self {
        ReconcileError::Io(e)
    }
}

/// A queue directory whose recorded versions could not be read
#[derive(Debug)]
pub struct UnreadableQueue {
    pub path: PathBuf,
    pub mode: QueueMode,
    pub error: ReconcileError,
}

/// One entry of `list_queues`
pub type ListedQueue = Result<QueueDescriptor, UnreadableQueue>;

/// Outcome of one successful `sync`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub path: PathBuf,
    /// Remote container the operations were applied to
    pub remote_id: String,
    /// Operations acknowledged during this sync
    pub synced: u64,
    pub rejected: Vec<RejectedOperation>,
}

pub struct Reconciler {
    config: OpsyncConfig,
}

impl Reconciler {
    pub fn new(config: OpsyncConfig) -> Self {
        Reconciler { config }
    }

    pub fn config(&self) -> &OpsyncConfig {
        &self.config
    }

    /// Every queue under `root`, async ones first, each group sorted by path.
    ///
    /// A directory that cannot be described is listed as `Err` and does not
    /// hide the others; only failing to walk `root` itself is an error.
    pub fn list_queues(&self, root: &Path) -> Result<Vec<ListedQueue>, ReconcileError> {
        let mut queues = Vec::new();

        for container_dir in sorted_subdirs(&root.join(ASYNC_DIRECTORY))? {
            if parse_dir_name(&container_dir).is_none() {
                debug!(dir = %container_dir.display(), "Skipping unrecognized directory");
                continue;
            }
            for exec_dir in sorted_subdirs(&container_dir)? {
                self.list_into(&exec_dir, QueueMode::Async, &mut queues);
            }
        }

        for queue_dir in sorted_subdirs(&root.join(OFFLINE_DIRECTORY))? {
            self.list_into(&queue_dir, QueueMode::Offline, &mut queues);
        }

        Ok(queues)
    }

    fn list_into(&self, dir: &Path, mode: QueueMode, out: &mut Vec<ListedQueue>) {
        match self.describe(dir) {
            Ok(Some(desc)) => out.push(Ok(desc)),
            Ok(None) => debug!(dir = %dir.display(), "Skipping unrecognized directory"),
            Err(error) => {
                warn!(dir = %dir.display(), error = %error, "Unreadable queue directory");
                out.push(Err(UnreadableQueue {
                    path: dir.to_path_buf(),
                    mode,
                    error,
                }));
            }
        }
    }

    /// Read the state of one queue directory without taking ownership or
    /// creating anything. `None` if `path` is not laid out as a queue
    /// directory or does not exist.
    pub fn describe(&self, path: &Path) -> Result<Option<QueueDescriptor>, ReconcileError> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let parent = path.parent();
        let parent_name = parent.and_then(|p| p.file_name()).and_then(|n| n.to_str());

        let (mode, container_type, container_id, execution_id) =
            if parent_name == Some(OFFLINE_DIRECTORY) {
                let Some((ct, id)) = parse_container_dir_name(name) else {
                    return Ok(None);
                };
                (QueueMode::Offline, ct, id, None)
            } else {
                let Some(exec) = name.strip_prefix(EXEC_PREFIX) else {
                    return Ok(None);
                };
                let async_parent = parent
                    .and_then(|p| p.parent())
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str());
                if async_parent != Some(ASYNC_DIRECTORY) {
                    return Ok(None);
                }
                let Some((ct, id)) = parent.and_then(parse_dir_name) else {
                    return Ok(None);
                };
                (QueueMode::Async, ct, id, Some(exec.to_string()))
            };

        let store = match LocalSegmentStore::open_existing(path.to_path_buf()) {
            Ok(store) => store,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (last_put_version, last_ack_version) = persisted_versions(&store)?;
        let metadata = match QueueMetadata::read(&store) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(dir = %path.display(), error = %e, "Unreadable queue metadata");
                None
            }
        };

        let class = if last_ack_version >= last_put_version {
            QueueClass::Synchronized
        } else {
            match mode {
                QueueMode::Async => QueueClass::UnsynchronizedOnline,
                QueueMode::Offline => QueueClass::UnsynchronizedOffline,
            }
        };

        Ok(Some(QueueDescriptor {
            path: path.to_path_buf(),
            mode,
            container_type,
            container_id,
            execution_id,
            metadata,
            last_put_version,
            last_ack_version,
            class,
        }))
    }

    /// Replay `desc` against the backend until every put is acknowledged.
    ///
    /// Offline queues are registered first, under their recorded project or
    /// else `project`; the remote id is saved in `metadata.json` so a
    /// retried sync reuses it.
    pub async fn sync(
        &self,
        desc: &QueueDescriptor,
        backend: &dyn SyncBackend,
        project: Option<&str>,
    ) -> Result<SyncReport, ReconcileError> {
        let queue = OperationQueue::open(
            LocalSegmentStore::new(desc.path.clone())?,
            self.config.queue.clone(),
        )?;

        let remote_id = match desc.mode {
            QueueMode::Async => desc.container_id.clone(),
            QueueMode::Offline => self.ensure_registered(desc, &queue, backend, project).await?,
        };

        let start = queue.last_acked_version();
        let target = queue.last_put_version();
        if start >= target {
            debug!(dir = %desc.path.display(), "Already synchronized");
            return Ok(SyncReport {
                path: desc.path.clone(),
                remote_id,
                synced: 0,
                rejected: Vec::new(),
            });
        }

        info!(
            queue = %desc.display_name(),
            remote_id = %remote_id,
            pending = target - start,
            "Syncing queue"
        );

        let sink = backend
            .sink_for(desc.container_type, &remote_id)
            .await
            .map_err(ReconcileError::Backend)?;
        let consumer = spawn_consumer(queue.clone(), sink, self.config.consumer.clone());

        let deadline = Instant::now() + self.config.sync.sync_timeout;
        let mut acks = queue.subscribe_acks();
        let outcome = loop {
            if *acks.borrow_and_update() >= target {
                break Ok(());
            }
            if consumer.is_finished() {
                let error = consumer
                    .last_error()
                    .unwrap_or_else(|| ConsumerError::Read("consumer exited".to_string()));
                break Err(ReconcileError::Consumer(error));
            }
            if Instant::now() >= deadline {
                break Err(ReconcileError::Timeout {
                    path: desc.path.clone(),
                    pending: target.saturating_sub(queue.last_acked_version()),
                });
            }
            tokio::select! {
                _ = acks.changed() => {}
                _ = tokio::time::sleep(self.config.consumer.poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        };

        if !consumer.stop(CONSUMER_STOP_TIMEOUT).await {
            warn!(dir = %desc.path.display(), "Sync consumer did not stop in time");
        }
        queue.sync()?;
        outcome?;

        let synced = queue.last_acked_version() - start;
        let rejected = consumer.rejected();
        info!(
            queue = %desc.display_name(),
            synced,
            rejected = rejected.len(),
            "Queue synchronized"
        );
        Ok(SyncReport {
            path: desc.path.clone(),
            remote_id,
            synced,
            rejected,
        })
    }

    async fn ensure_registered(
        &self,
        desc: &QueueDescriptor,
        queue: &OperationQueue<LocalSegmentStore>,
        backend: &dyn SyncBackend,
        project: Option<&str>,
    ) -> Result<String, ReconcileError> {
        let mut metadata = QueueMetadata::read(queue.store())?.unwrap_or_else(|| {
            QueueMetadata::offline(desc.container_type, desc.container_id.clone(), None)
        });
        if let Some(id) = &metadata.registered_id {
            return Ok(id.clone());
        }

        let project = metadata
            .project
            .clone()
            .or_else(|| project.map(str::to_string))
            .ok_or_else(|| ReconcileError::MissingProject(desc.path.clone()))?;
        let id = backend
            .register_offline(desc.container_type, &project)
            .await
            .map_err(ReconcileError::Backend)?;

        info!(
            queue = %desc.display_name(),
            project = %project,
            remote_id = %id,
            "Registered offline container"
        );
        metadata.project = Some(project);
        metadata.registered_id = Some(id.clone());
        metadata.write(queue.store())?;
        Ok(id)
    }

    /// Remove a queue directory and, for async queues, its container
    /// directory once empty. Returns the removed paths.
    pub fn delete(
        &self,
        desc: &QueueDescriptor,
        policy: DeletePolicy,
    ) -> Result<Vec<PathBuf>, ReconcileError> {
        if policy == DeletePolicy::RequireSynchronized && !desc.is_synchronized() {
            return Err(ReconcileError::NotSynchronized {
                path: desc.path.clone(),
                pending: desc.pending_count(),
            });
        }

        let store = LocalSegmentStore::open_existing(desc.path.clone())?;
        let guard = store.acquire()?;

        // The owner may have written more since `desc` was taken
        if policy == DeletePolicy::RequireSynchronized {
            let (put, ack) = persisted_versions(&store)?;
            if ack < put {
                return Err(ReconcileError::NotSynchronized {
                    path: desc.path.clone(),
                    pending: put - ack,
                });
            }
        }

        let removed = remove_queue_dir(&desc.path, desc.mode, guard)?;
        info!(
            queue = %desc.display_name(),
            pending_lost = if policy == DeletePolicy::Force { desc.pending_count() } else { 0 },
            "Deleted queue directory"
        );
        Ok(removed)
    }

    /// Remove a directory `list_queues` could not read. Whatever it held is
    /// lost; a live owner still blocks the removal.
    pub fn delete_unreadable(&self, queue: &UnreadableQueue) -> Result<Vec<PathBuf>, ReconcileError> {
        let store = LocalSegmentStore::open_existing(queue.path.clone())?;
        let guard = store.acquire()?;
        let removed = remove_queue_dir(&queue.path, queue.mode, guard)?;
        warn!(dir = %queue.path.display(), "Deleted unreadable queue directory");
        Ok(removed)
    }
}

/// Remove `path` while holding its lock, then its container directory if
/// that is left empty
fn remove_queue_dir<G>(path: &Path, mode: QueueMode, guard: G) -> Result<Vec<PathBuf>, ReconcileError> {
    std::fs::remove_dir_all(path)?;
    drop(guard);
    let mut removed = vec![path.to_path_buf()];

    if mode == QueueMode::Async {
        if let Some(parent) = path.parent() {
            if is_empty_dir(parent)? {
                std::fs::remove_dir(parent)?;
                removed.push(parent.to_path_buf());
            }
        }
    }
    Ok(removed)
}

fn parse_dir_name(path: &Path) -> Option<(ContainerType, String)> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_container_dir_name)
}

/// Subdirectories of `dir` sorted by name; empty if `dir` does not exist
fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>, ReconcileError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn is_empty_dir(dir: &Path) -> Result<bool, ReconcileError> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
