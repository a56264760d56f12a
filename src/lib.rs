pub mod buggify;
pub mod config;
pub mod io;
pub mod observability;
pub mod queue;

pub use config::{ConsumerConfig, FsyncPolicy, OpsyncConfig, QueueConfig, SyncConfig};
pub use queue::{
    ContainerType, Operation, OperationProcessor, OperationQueue, QueuedOperation, Reconciler,
    RemoteSink, SubmitOutcome, SyncBackend,
};
