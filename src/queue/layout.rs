//! Queue directory layout under a root
//!
//! ```text
//! <root>/
//!   async/
//!     run__RUN-17/
//!       exec-1718031100123-4242/     one queue per execution
//!         data-1.log
//!         last_put_version
//!         ...
//!   offline/
//!     run__5c0f1e2a9b7d4c11/         no remote id yet; local id only
//! ```

use crate::io::production::ProductionRng;
use crate::io::Rng;
use crate::queue::operation::ContainerType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ASYNC_DIRECTORY: &str = "async";
pub const OFFLINE_DIRECTORY: &str = "offline";
pub const EXEC_PREFIX: &str = "exec-";

/// Whether a queue already belongs to a remote container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Drained in the background while the owning process runs
    Async,
    /// Recorded locally; replayed later by sync
    Offline,
}

/// `<type>__<id>`
pub fn container_dir_name(container_type: ContainerType, id: &str) -> String {
    format!("{}__{}", container_type, id)
}

pub fn parse_container_dir_name(name: &str) -> Option<(ContainerType, String)> {
    let (kind, id) = name.split_once("__")?;
    if id.is_empty() {
        return None;
    }
    Some((kind.parse().ok()?, id.to_string()))
}

pub fn async_queue_dir(
    root: &Path,
    container_type: ContainerType,
    container_id: &str,
    execution_id: &str,
) -> PathBuf {
    root.join(ASYNC_DIRECTORY)
        .join(container_dir_name(container_type, container_id))
        .join(format!("{}{}", EXEC_PREFIX, execution_id))
}

pub fn offline_queue_dir(root: &Path, container_type: ContainerType, local_id: &str) -> PathBuf {
    root.join(OFFLINE_DIRECTORY)
        .join(container_dir_name(container_type, local_id))
}

/// `<unix millis>-<pid>`, unique per process start
pub fn new_execution_id() -> String {
    format!("{}-{}", now_millis(), std::process::id())
}

/// Random identifier for a container that has no remote id yet
pub fn new_local_id() -> String {
    format!("{:016x}", ProductionRng::new().next_u64())
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
