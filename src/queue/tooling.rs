//! Sync and clear entry points for command-line tooling
//!
//! Both walk every queue under a root, keep going past per-queue failures
//! and report each outcome; `exit_code()` is non-zero if anything failed.

use crate::queue::reconcile::{
    DeletePolicy, QueueClass, QueueDescriptor, ReconcileError, Reconciler, SyncBackend, SyncReport,
    UnreadableQueue,
};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub synced: Vec<SyncReport>,
    pub deleted: Vec<PathBuf>,
    /// Queues belonging to another project
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl SyncSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Replay every unsynchronized queue under `root`.
///
/// With `project_filter`, queues recorded for a different project are
/// skipped, and offline queues recorded without a project are registered
/// under the filter. Drained directories are removed when
/// `sync.delete_after_sync` is set. Unreadable queue directories are
/// reported as failed and left in place.
pub async fn sync_all(
    reconciler: &Reconciler,
    root: &Path,
    backend: &dyn SyncBackend,
    project_filter: Option<&str>,
) -> Result<SyncSummary, ReconcileError> {
    let mut summary = SyncSummary::default();
    let delete_after = reconciler.config().sync.delete_after_sync;

    for listed in reconciler.list_queues(root)? {
        let desc = match listed {
            Ok(desc) => desc,
            Err(unreadable) => {
                error!(dir = %unreadable.path.display(), error = %unreadable.error, "Cannot read queue");
                summary
                    .failed
                    .push((unreadable.path, unreadable.error.to_string()));
                continue;
            }
        };
        if let (Some(filter), Some(project)) = (project_filter, desc.project()) {
            if project != filter {
                info!(queue = %desc.display_name(), project, "Skipping queue of another project");
                summary.skipped.push(desc.path.clone());
                continue;
            }
        }

        if !desc.is_synchronized() {
            match reconciler.sync(&desc, backend, project_filter).await {
                Ok(report) => summary.synced.push(report),
                Err(e) => {
                    error!(queue = %desc.display_name(), error = %e, "Sync failed");
                    summary.failed.push((desc.path.clone(), e.to_string()));
                    continue;
                }
            }
        }

        if delete_after {
            // Re-read: the sync above moved the acknowledged version
            let removed = match reconciler.describe(&desc.path) {
                Ok(Some(fresh)) => reconciler.delete(&fresh, DeletePolicy::RequireSynchronized),
                Ok(None) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
            match removed {
                Ok(paths) => summary.deleted.extend(paths),
                Err(e) => {
                    error!(queue = %desc.display_name(), error = %e, "Delete after sync failed");
                    summary.failed.push((desc.path.clone(), e.to_string()));
                }
            }
        }
    }

    info!(
        synced = summary.synced.len(),
        deleted = summary.deleted.len(),
        skipped = summary.skipped.len(),
        failed = summary.failed.len(),
        "Sync finished"
    );
    Ok(summary)
}

/// Queues found by `clear`, grouped the way they are presented for
/// confirmation
#[derive(Debug, Default)]
pub struct ClearPlan {
    pub synchronized: Vec<QueueDescriptor>,
    pub online: Vec<QueueDescriptor>,
    pub offline: Vec<QueueDescriptor>,
    /// Directories whose state could not be read; treated as unsynchronized
    pub unreadable: Vec<UnreadableQueue>,
}

impl ClearPlan {
    pub fn has_unsynchronized(&self) -> bool {
        !self.online.is_empty() || !self.offline.is_empty() || !self.unreadable.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ClearSummary {
    pub deleted: Vec<PathBuf>,
    /// Unsynchronized queues left in place because deletion was not confirmed
    pub kept: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl ClearSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Remove queue directories under `root`. Synchronized queues go
/// unconditionally; unsynchronized ones only if `confirm` agrees after
/// seeing the plan. Offline queues are removed before online ones.
pub fn clear<F>(reconciler: &Reconciler, root: &Path, confirm: F) -> Result<ClearSummary, ReconcileError>
where
    F: FnOnce(&ClearPlan) -> bool,
{
    let mut plan = ClearPlan::default();
    for listed in reconciler.list_queues(root)? {
        match listed {
            Ok(desc) => match desc.class {
                QueueClass::Synchronized => plan.synchronized.push(desc),
                QueueClass::UnsynchronizedOnline => plan.online.push(desc),
                QueueClass::UnsynchronizedOffline => plan.offline.push(desc),
            },
            Err(unreadable) => plan.unreadable.push(unreadable),
        }
    }

    let mut summary = ClearSummary::default();
    for desc in &plan.synchronized {
        delete_into(reconciler, desc, DeletePolicy::RequireSynchronized, &mut summary);
    }

    if plan.has_unsynchronized() {
        if confirm(&plan) {
            for desc in plan.offline.iter().chain(plan.online.iter()) {
                delete_into(reconciler, desc, DeletePolicy::Force, &mut summary);
            }
            for unreadable in &plan.unreadable {
                match reconciler.delete_unreadable(unreadable) {
                    Ok(paths) => summary.deleted.extend(paths),
                    Err(e) => {
                        error!(dir = %unreadable.path.display(), error = %e, "Delete failed");
                        summary.failed.push((unreadable.path.clone(), e.to_string()));
                    }
                }
            }
        } else {
            info!(
                online = plan.online.len(),
                offline = plan.offline.len(),
                unreadable = plan.unreadable.len(),
                "Keeping unsynchronized queues"
            );
            summary
                .kept
                .extend(plan.offline.iter().chain(plan.online.iter()).map(|d| d.path.clone()));
            summary
                .kept
                .extend(plan.unreadable.iter().map(|u| u.path.clone()));
        }
    }

    info!(
        deleted = summary.deleted.len(),
        kept = summary.kept.len(),
        failed = summary.failed.len(),
        "Clear finished"
    );
    Ok(summary)
}

fn delete_into(
    reconciler: &Reconciler,
    desc: &QueueDescriptor,
    policy: DeletePolicy,
    summary: &mut ClearSummary,
) {
    match reconciler.delete(desc, policy) {
        Ok(paths) => summary.deleted.extend(paths),
        Err(e) => {
            error!(queue = %desc.display_name(), error = %e, "Delete failed");
            summary.failed.push((desc.path.clone(), e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpsyncConfig, QueueConfig};
    use crate::queue::consumer::{RemoteSink, SubmitOutcome};
    use crate::queue::disk_queue::OperationQueue;
    use crate::queue::layout::{async_queue_dir, offline_queue_dir, QueueMode};
    use crate::queue::metadata::{QueueMetadata, LAST_PUT_VERSION_FILE};
    use crate::queue::operation::{parse_path, ContainerType, Operation, QueuedOperation};
    use crate::queue::store::LocalSegmentStore;
    use parking_lot::Mutex;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    struct AckAll;

    impl RemoteSink for AckAll {
        fn submit<'a>(
            &'a self,
            _op: &'a QueuedOperation,
        ) -> Pin<Box<dyn Future<Output = SubmitOutcome> + Send + 'a>> {
            Box::pin(async { SubmitOutcome::Acked })
        }
    }

    #[derive(Default)]
    struct Backend {
        sinks: Mutex<Vec<String>>,
        registered: Mutex<Vec<String>>,
    }

    impl SyncBackend for Backend {
        fn sink_for<'a>(
            &'a self,
            _container_type: ContainerType,
            container_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RemoteSink>, String>> + Send + 'a>>
        {
            Box::pin(async move {
                self.sinks.lock().push(container_id.to_string());
                Ok(Arc::new(AckAll) as Arc<dyn RemoteSink>)
            })
        }

        fn register_offline<'a>(
            &'a self,
            _container_type: ContainerType,
            project: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
            Box::pin(async move {
                self.registered.lock().push(project.to_string());
                Ok("RUN-100".to_string())
            })
        }
    }

    fn fill(dir: &Path, puts: u64, acks: u64, project: Option<&str>, mode: QueueMode) {
        let queue = OperationQueue::open(
            LocalSegmentStore::new(dir.to_path_buf()).unwrap(),
            QueueConfig::test(),
        )
        .unwrap();
        for i in 0..puts {
            queue
                .put(Operation::AssignInt {
                    path: parse_path("n"),
                    value: i as i64,
                })
                .unwrap();
        }
        if acks > 0 {
            queue.ack(acks).unwrap();
        }
        let id = dir.file_name().unwrap().to_string_lossy().to_string();
        let meta = match mode {
            QueueMode::Async => {
                QueueMetadata::online(ContainerType::Run, "RUN-1", id, project.map(String::from))
            }
            QueueMode::Offline => {
                QueueMetadata::offline(ContainerType::Run, id, project.map(String::from))
            }
        };
        meta.write(queue.store()).unwrap();
    }

    #[tokio::test]
    async fn test_sync_all_with_project_filter() {
        let root = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(OpsyncConfig::test(root.path().to_path_buf()));
        let mine = async_queue_dir(root.path(), ContainerType::Run, "RUN-1", "1");
        let theirs = async_queue_dir(root.path(), ContainerType::Run, "RUN-2", "1");
        let offline = offline_queue_dir(root.path(), ContainerType::Run, "abcd");
        fill(&mine, 3, 0, Some("ws/mine"), QueueMode::Async);
        fill(&theirs, 3, 0, Some("ws/theirs"), QueueMode::Async);
        fill(&offline, 2, 0, None, QueueMode::Offline);

        let backend = Backend::default();
        let summary = sync_all(&reconciler, root.path(), &backend, Some("ws/mine"))
            .await
            .unwrap();

        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.synced.len(), 2);
        assert_eq!(summary.skipped, vec![theirs.clone()]);
        assert_eq!(*backend.registered.lock(), vec!["ws/mine".to_string()]);
        assert_eq!(*backend.sinks.lock(), vec!["RUN-1".to_string(), "RUN-100".to_string()]);
        assert!(!mine.exists());
        assert!(!offline.exists());
        assert!(theirs.exists());
    }

    #[tokio::test]
    async fn test_sync_all_reports_missing_project() {
        let root = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(OpsyncConfig::test(root.path().to_path_buf()));
        let offline = offline_queue_dir(root.path(), ContainerType::Run, "abcd");
        fill(&offline, 1, 0, None, QueueMode::Offline);

        let summary = sync_all(&reconciler, root.path(), &Backend::default(), None)
            .await
            .unwrap();
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert!(offline.exists());
    }

    #[tokio::test]
    async fn test_sync_all_continues_past_unreadable_queue() {
        let root = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(OpsyncConfig::test(root.path().to_path_buf()));
        let good = async_queue_dir(root.path(), ContainerType::Run, "RUN-1", "1");
        let bad = async_queue_dir(root.path(), ContainerType::Run, "RUN-2", "1");
        fill(&good, 2, 0, None, QueueMode::Async);
        fill(&bad, 2, 0, None, QueueMode::Async);
        std::fs::write(bad.join(LAST_PUT_VERSION_FILE), "garbage").unwrap();

        let summary = sync_all(&reconciler, root.path(), &Backend::default(), None)
            .await
            .unwrap();
        assert_eq!(summary.synced.len(), 1);
        assert_eq!(summary.synced[0].synced, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, bad);
        assert_eq!(summary.exit_code(), 1);
        assert!(!good.exists());
        assert!(bad.exists());
    }

    #[test]
    fn test_clear_handles_unreadable_queue() {
        let root = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(OpsyncConfig::test(root.path().to_path_buf()));
        let bad = offline_queue_dir(root.path(), ContainerType::Run, "abcd");
        fill(&bad, 1, 1, None, QueueMode::Offline);
        std::fs::write(bad.join(LAST_PUT_VERSION_FILE), "garbage").unwrap();

        let summary = clear(&reconciler, root.path(), |plan| {
            assert_eq!(plan.unreadable.len(), 1);
            false
        })
        .unwrap();
        assert_eq!(summary.kept, vec![bad.clone()]);
        assert!(bad.exists());

        let summary = clear(&reconciler, root.path(), |_| true).unwrap();
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.deleted, vec![bad.clone()]);
        assert!(!bad.exists());
    }

    #[test]
    fn test_clear_declined_keeps_unsynchronized() {
        let root = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(OpsyncConfig::test(root.path().to_path_buf()));
        let done = async_queue_dir(root.path(), ContainerType::Run, "RUN-1", "1");
        let pending = async_queue_dir(root.path(), ContainerType::Run, "RUN-2", "1");
        let offline = offline_queue_dir(root.path(), ContainerType::Run, "abcd");
        fill(&done, 2, 2, None, QueueMode::Async);
        fill(&pending, 2, 1, None, QueueMode::Async);
        fill(&offline, 1, 0, None, QueueMode::Offline);

        let mut seen = (0, 0, 0);
        let summary = clear(&reconciler, root.path(), |plan| {
            seen = (plan.synchronized.len(), plan.online.len(), plan.offline.len());
            false
        })
        .unwrap();

        assert_eq!(seen, (1, 1, 1));
        assert!(!done.exists());
        assert!(pending.exists());
        assert!(offline.exists());
        assert_eq!(summary.kept, vec![offline, pending]);
    }

    #[test]
    fn test_clear_confirmed_removes_everything() {
        let root = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(OpsyncConfig::test(root.path().to_path_buf()));
        let pending = async_queue_dir(root.path(), ContainerType::Run, "RUN-2", "1");
        let offline = offline_queue_dir(root.path(), ContainerType::Run, "abcd");
        fill(&pending, 2, 0, None, QueueMode::Async);
        fill(&offline, 1, 0, None, QueueMode::Offline);

        let summary = clear(&reconciler, root.path(), |_| true).unwrap();
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(
            summary.deleted,
            vec![offline, pending.clone(), pending.parent().unwrap().to_path_buf()]
        );
        assert!(reconciler.list_queues(root.path()).unwrap().is_empty());
    }

    #[test]
    fn test_clear_without_unsynchronized_skips_confirmation() {
        let root = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(OpsyncConfig::test(root.path().to_path_buf()));
        let summary = clear(&reconciler, root.path(), |_| panic!("no prompt expected")).unwrap();
        assert!(summary.deleted.is_empty());
    }
}
