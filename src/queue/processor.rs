//! Operation Processor
//!
//! The handle producers hold for one container: a queue plus, in async mode,
//! the consumer draining it. There is no process-wide "current" processor;
//! callers keep this value and pass it where operations are recorded.

use crate::config::{ConsumerConfig, OpsyncConfig};
use crate::queue::consumer::{
    spawn_consumer, ConsumerError, ConsumerHandle, ConsumerState, RejectedOperation, RemoteSink,
};
use crate::queue::disk_queue::{OperationQueue, QueueError};
use crate::queue::layout::{async_queue_dir, new_execution_id, new_local_id, offline_queue_dir};
use crate::queue::metadata::QueueMetadata;
use crate::queue::operation::{ContainerType, Operation};
use crate::queue::store::{LocalSegmentStore, SegmentStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug)]
pub enum ProcessorError {
    Queue(QueueError),
    /// Only `run` containers can be recorded without a remote id
    OfflineNotSupported(ContainerType),
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorError::Queue(e) => write!(f, "{}", e),
            ProcessorError::OfflineNotSupported(ct) => {
                write!(f, "Offline mode is not supported for {} containers", ct)
            }
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<QueueError> for ProcessorError {
    fn from(e: QueueError) -> Self {
        ProcessorError::Queue(e)
    }
}

impl From<StoreError> for ProcessorError {
    fn from(e: StoreError) -> Self {
        ProcessorError::Queue(QueueError::from(e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorStatus {
    pub pending_count: u64,
    pub last_acked_version: u64,
    pub last_put_version: u64,
    /// `None` in offline mode
    pub consumer_state: Option<ConsumerState>,
    pub rejected: Vec<RejectedOperation>,
    pub last_error: Option<ConsumerError>,
}

pub struct OperationProcessor<S: SegmentStore> {
    queue: OperationQueue<S>,
    consumer: Option<ConsumerHandle>,
    dir: Option<PathBuf>,
}

impl<S: SegmentStore> OperationProcessor<S> {
    /// Drain `queue` into `sink` in the background
    pub fn start(
        queue: OperationQueue<S>,
        sink: Arc<dyn RemoteSink>,
        config: ConsumerConfig,
    ) -> Self {
        let consumer = spawn_consumer(queue.clone(), sink, config);
        OperationProcessor {
            queue,
            consumer: Some(consumer),
            dir: None,
        }
    }

    /// Record only; operations wait on disk for a later sync
    pub fn offline(queue: OperationQueue<S>) -> Self {
        OperationProcessor {
            queue,
            consumer: None,
            dir: None,
        }
    }

    /// Durably record `op`; returns its version
    pub fn enqueue(&self, op: Operation) -> Result<u64, ProcessorError> {
        Ok(self.queue.put(op)?)
    }

    /// Make everything enqueued so far durable and wait until the consumer
    /// has acknowledged it. `Ok(false)` means the timeout elapsed first, or,
    /// offline, that operations are waiting for a sync.
    pub async fn flush(&self, timeout: Duration) -> Result<bool, ProcessorError> {
        self.queue.sync()?;
        if self.consumer.is_none() {
            return Ok(self.queue.status().pending_count == 0);
        }

        let target = self.queue.last_put_version();
        let mut acks = self.queue.subscribe_acks();
        let reached = tokio::time::timeout(timeout, acks.wait_for(|&acked| acked >= target)).await;
        Ok(matches!(reached, Ok(Ok(_))))
    }

    /// Ask the consumer to stop after its current operation
    pub fn interrupt(&self) {
        if let Some(consumer) = &self.consumer {
            consumer.interrupt();
        }
    }

    /// Stop the consumer and fsync the queue. `Ok(false)` means the
    /// consumer did not exit within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<bool, ProcessorError> {
        let finished = match &self.consumer {
            Some(consumer) => consumer.stop(timeout).await,
            None => true,
        };
        if !finished {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Consumer still draining after stop timeout"
            );
        }
        self.queue.sync()?;

        let status = self.queue.status();
        if status.pending_count > 0 {
            info!(
                pending = status.pending_count,
                dir = ?self.dir,
                "Unsynchronized operations left on disk"
            );
        }
        Ok(finished)
    }

    pub fn status(&self) -> ProcessorStatus {
        let queue = self.queue.status();
        ProcessorStatus {
            pending_count: queue.pending_count,
            last_acked_version: queue.last_acked_version,
            last_put_version: queue.last_put_version,
            consumer_state: self.consumer.as_ref().map(ConsumerHandle::state),
            rejected: self
                .consumer
                .as_ref()
                .map(ConsumerHandle::rejected)
                .unwrap_or_default(),
            last_error: self.consumer.as_ref().and_then(ConsumerHandle::last_error),
        }
    }

    pub fn queue(&self) -> &OperationQueue<S> {
        &self.queue
    }

    /// Queue directory, for processors opened under a root
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

impl OperationProcessor<LocalSegmentStore> {
    /// New execution queue for a remote container, drained into `sink`
    pub fn open_async(
        root: &Path,
        container_type: ContainerType,
        container_id: &str,
        project: Option<String>,
        sink: Arc<dyn RemoteSink>,
        config: &OpsyncConfig,
    ) -> Result<Self, ProcessorError> {
        let execution_id = new_execution_id();
        let dir = async_queue_dir(root, container_type, container_id, &execution_id);
        let queue = OperationQueue::open(LocalSegmentStore::new(dir.clone())?, config.queue.clone())?;
        QueueMetadata::online(container_type, container_id, execution_id, project)
            .write(queue.store())?;

        info!(dir = %dir.display(), %container_type, container_id, "Started async queue");
        let mut processor = Self::start(queue, sink, config.consumer.clone());
        processor.dir = Some(dir);
        Ok(processor)
    }

    /// New offline queue for a container that has no remote id yet
    pub fn open_offline(
        root: &Path,
        container_type: ContainerType,
        project: Option<String>,
        config: &OpsyncConfig,
    ) -> Result<Self, ProcessorError> {
        if !container_type.supports_offline() {
            return Err(ProcessorError::OfflineNotSupported(container_type));
        }

        let local_id = new_local_id();
        let dir = offline_queue_dir(root, container_type, &local_id);
        let queue = OperationQueue::open(LocalSegmentStore::new(dir.clone())?, config.queue.clone())?;
        QueueMetadata::offline(container_type, local_id, project).write(queue.store())?;

        info!(dir = %dir.display(), %container_type, "Started offline queue");
        let mut processor = Self::offline(queue);
        processor.dir = Some(dir);
        Ok(processor)
    }
}
