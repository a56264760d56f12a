//! Durable operation queue and synchronization
//!
//! ```text
//!  producer ─► OperationProcessor::enqueue ─► OperationQueue (data-N.log)
//!                                                   │
//!                                        Consumer ◄─┘ read_from(last_ack)
//!                                           │
//!                                           ▼
//!                                      RemoteSink ── Acked ──► ack(v)
//!
//!  tooling ─► Reconciler ─► list / sync / delete queue directories
//! ```
//!
//! - `codec` / `splitter`: record format and incremental extraction
//! - `store` / `segment` / `metadata` / `layout`: on-disk representation
//! - `disk_queue`: versioned put / ack / read_from
//! - `consumer` / `processor`: background draining
//! - `reconcile` / `tooling`: offline sync and cleanup
//! - `dst`: deterministic simulation of the whole pipeline

pub mod codec;
pub mod consumer;
pub mod disk_queue;
pub mod dst;
pub mod layout;
pub mod metadata;
pub mod operation;
pub mod processor;
pub mod reconcile;
pub mod segment;
pub mod splitter;
pub mod store;
pub mod tooling;

pub use codec::CodecError;
pub use consumer::{
    spawn_consumer, ConsumerError, ConsumerHandle, ConsumerState, ConsumerStats,
    RejectedOperation, RemoteSink, SubmitOutcome,
};
pub use disk_queue::{OperationQueue, QueueError, QueueReader, QueueStatus};
pub use dst::{
    run_queue_dst_batch, summarize_queue_dst_batch, QueueDSTConfig, QueueDSTHarness,
    QueueDSTResult, RemoteFaultConfig, SimulatedBackend, SimulatedRemote,
};
pub use layout::QueueMode;
pub use metadata::{AckCheckpoint, QueueMetadata};
pub use operation::{ContainerType, LogEntry, Operation, QueuedOperation};
pub use processor::{OperationProcessor, ProcessorError, ProcessorStatus};
pub use reconcile::{
    DeletePolicy, ListedQueue, QueueClass, QueueDescriptor, ReconcileError, Reconciler,
    SyncBackend, SyncReport, UnreadableQueue,
};
pub use splitter::{RecordSplitter, SplitterError};
pub use store::{
    InMemorySegmentStore, LocalSegmentStore, SegmentStore, SegmentWriter, SimulatedSegmentStore,
    SimulatedStoreConfig, StoreError,
};
pub use tooling::{clear, sync_all, ClearPlan, ClearSummary, SyncSummary};
