//! Background Consumer
//!
//! One task per queue drains operations to a `RemoteSink` in version order:
//!
//! ```text
//!   read_from(last_ack) ─► submit ─► Acked ──────► ack(v) ─► next
//!                            │
//!                            ├─► Retryable ─► backoff ─► submit same op again
//!                            └─► Fatal ─────► report ─► ack(v) ─► next
//! ```
//!
//! Interruption is cooperative. The token is checked between submissions and
//! during waits; a submission already in flight completes and is acknowledged
//! before the task exits. Unacknowledged operations stay in the queue for the
//! next consumer.

use crate::config::ConsumerConfig;
use crate::queue::disk_queue::{OperationQueue, QueueReader};
use crate::queue::operation::QueuedOperation;
use crate::queue::store::SegmentStore;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of submitting one operation to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Applied remotely
    Acked,
    /// Transient failure; the same operation is submitted again later
    Retryable(String),
    /// Permanently rejected; reported and skipped
    Fatal(String),
}

/// Remote submission callback supplied by the backend layer
pub trait RemoteSink: Send + Sync + 'static {
    fn submit<'a>(
        &'a self,
        op: &'a QueuedOperation,
    ) -> Pin<Box<dyn Future<Output = SubmitOutcome> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created, task not started yet
    Idle,
    Running,
    /// Exited after `interrupt()`
    Interrupted,
    /// Exited for good: stopped by its owner or by an error
    Stopped,
}

/// Failure that ended a consumer. Never propagated to producers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Stored operations could not be read
    Read(String),
    /// An acknowledgment could not be persisted
    Ack(String),
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerError::Read(msg) => write!(f, "Consumer read failed: {}", msg),
            ConsumerError::Ack(msg) => write!(f, "Consumer ack failed: {}", msg),
        }
    }
}

impl std::error::Error for ConsumerError {}

/// An operation the backend refused permanently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOperation {
    pub version: u64,
    pub kind: &'static str,
    pub path: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub submissions: u64,
    pub acked: u64,
    pub retries: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct ConsumerShared {
    state: Mutex<ConsumerState>,
    rejected: Mutex<Vec<RejectedOperation>>,
    last_error: Mutex<Option<ConsumerError>>,
    submissions: AtomicU64,
    acked: AtomicU64,
    retries: AtomicU64,
}

impl ConsumerShared {
    fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }
}

struct Consumer<S: SegmentStore> {
    queue: OperationQueue<S>,
    sink: Arc<dyn RemoteSink>,
    config: ConsumerConfig,
    cancel: CancellationToken,
    shared: Arc<ConsumerShared>,
}

impl<S: SegmentStore> Consumer<S> {
    async fn run(self) {
        let start = self.queue.last_acked_version();
        self.shared.set_state(ConsumerState::Running);
        info!(from_version = start, "Consumer started");

        match self.drain(start).await {
            Ok(()) => {
                self.shared.set_state(ConsumerState::Interrupted);
                info!(
                    last_acked = self.queue.last_acked_version(),
                    "Consumer interrupted"
                );
            }
            Err(e) => {
                error!(error = %e, "Consumer stopped");
                *self.shared.last_error.lock() = Some(e);
                self.shared.set_state(ConsumerState::Stopped);
            }
        }
    }

    async fn drain(&self, start: u64) -> Result<(), ConsumerError> {
        let mut reader = self
            .queue
            .read_from(start)
            .map_err(|e| ConsumerError::Read(e.to_string()))?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let next = reader
                .next_operation()
                .map_err(|e| ConsumerError::Read(e.to_string()))?;
            let Some(op) = next else {
                if let Err(e) = self.queue.sync_if_due() {
                    warn!(error = %e, "Periodic fsync failed");
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = self.queue.wait_for_put() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            if !self.deliver(&op).await {
                return Ok(());
            }
            self.acknowledge(&reader, op.version)?;
        }
    }

    /// Submit until the backend accepts or rejects. `false` if interrupted
    /// while backing off (the operation stays unacknowledged).
    async fn deliver(&self, op: &QueuedOperation) -> bool {
        let mut backoff = self.config.retry_initial_backoff;
        loop {
            self.shared.submissions.fetch_add(1, Ordering::Relaxed);
            match self.sink.submit(op).await {
                SubmitOutcome::Acked => return true,
                SubmitOutcome::Fatal(reason) => {
                    error!(
                        version = op.version,
                        kind = op.obj.kind(),
                        reason = %reason,
                        "Operation rejected by backend, skipping"
                    );
                    self.shared.rejected.lock().push(RejectedOperation {
                        version: op.version,
                        kind: op.obj.kind(),
                        path: op.obj.path().to_vec(),
                        reason,
                    });
                    return true;
                }
                SubmitOutcome::Retryable(reason) => {
                    self.shared.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        version = op.version,
                        reason = %reason,
                        backoff_ms = backoff.as_millis() as u64,
                        "Submission failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff, self.config.retry_max_backoff);
                }
            }
        }
    }

    fn acknowledge(&self, reader: &QueueReader<S>, version: u64) -> Result<(), ConsumerError> {
        let result = match reader.checkpoint() {
            Some(cp) if cp.version == version => self.queue.ack_with_checkpoint(cp),
            _ => self.queue.ack(version),
        };
        result.map_err(|e| ConsumerError::Ack(e.to_string()))?;
        self.shared.acked.fetch_add(1, Ordering::Relaxed);
        debug!(version, "Acknowledged");
        Ok(())
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Handle to a running consumer task
#[derive(Debug)]
pub struct ConsumerHandle {
    cancel: CancellationToken,
    shared: Arc<ConsumerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Attach a consumer to `queue` and start draining. Must be called within
/// a tokio runtime.
pub fn spawn_consumer<S: SegmentStore>(
    queue: OperationQueue<S>,
    sink: Arc<dyn RemoteSink>,
    config: ConsumerConfig,
) -> ConsumerHandle {
    debug_assert!(
        config.retry_initial_backoff <= config.retry_max_backoff,
        "Precondition: initial backoff must not exceed max backoff"
    );

    let cancel = CancellationToken::new();
    let shared = Arc::new(ConsumerShared {
        state: Mutex::new(ConsumerState::Idle),
        rejected: Mutex::new(Vec::new()),
        last_error: Mutex::new(None),
        submissions: AtomicU64::new(0),
        acked: AtomicU64::new(0),
        retries: AtomicU64::new(0),
    });
    let consumer = Consumer {
        queue,
        sink,
        config,
        cancel: cancel.clone(),
        shared: Arc::clone(&shared),
    };
    let task = tokio::spawn(consumer.run());

    ConsumerHandle {
        cancel,
        shared,
        task: Mutex::new(Some(task)),
    }
}

impl ConsumerHandle {
    /// Ask the consumer to stop after the current operation
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to exit. `false` means the timeout elapsed and the
    /// consumer is still draining; calling `join` again keeps waiting.
    pub async fn join(&self, timeout: Duration) -> bool {
        let Some(mut task) = self.task.lock().take() else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Consumer task failed");
                *self.shared.last_error.lock() = Some(ConsumerError::Read(e.to_string()));
                self.shared.set_state(ConsumerState::Stopped);
                true
            }
            Err(_) => {
                *self.task.lock() = Some(task);
                false
            }
        }
    }

    /// `interrupt` then `join`
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.interrupt();
        let finished = self.join(timeout).await;
        if finished {
            self.shared.set_state(ConsumerState::Stopped);
        }
        finished
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state.lock()
    }

    /// True once the task has exited (interrupted, stopped or failed)
    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(true, |task| task.is_finished())
    }

    pub fn rejected(&self) -> Vec<RejectedOperation> {
        self.shared.rejected.lock().clone()
    }

    pub fn last_error(&self) -> Option<ConsumerError> {
        self.shared.last_error.lock().clone()
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            submissions: self.shared.submissions.load(Ordering::Relaxed),
            acked: self.shared.acked.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
            rejected: self.shared.rejected.lock().len() as u64,
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
