//! Spawns handler executions and tracks their status.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BackgroundTaskHandler, TaskManifest};
use crate::error::{StorageError, StorageResult};

/// Lifecycle of one spawned task.
#[derive(Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Finished statuses kept for `status` / `wait` lookups.
pub const DEFAULT_STATUS_RETENTION: usize = 1024;

/// Bookkeeping shared between the runner and its spawned tasks.
struct Registry {
    statuses: DashMap<Uuid, TaskStatus>,
    inflight: DashMap<String, Uuid>,
    handles: DashMap<Uuid, JoinHandle<()>>,
    finished: Mutex<VecDeque<Uuid>>,
    retention: usize,
}

impl Registry {
    /// Record a final status, evicting the oldest beyond the retention.
    fn finish(&self, task_id: Uuid, status: TaskStatus) {
        self.statuses.insert(task_id, status);
        let mut finished = self.finished.lock();
        finished.push_back(task_id);
        while finished.len() > self.retention {
            if let Some(old) = finished.pop_front() {
                self.statuses.remove(&old);
            }
        }
    }
}

/// Releases a task's key and handle when its body ends, however it ends.
struct TaskGuard {
    registry: Arc<Registry>,
    task_id: Uuid,
    key: String,
    status: Option<TaskStatus>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let status = self.status.take().unwrap_or_else(|| TaskStatus::Failed {
            message: "task aborted".to_string(),
        });
        self.registry.finish(self.task_id, status);
        self.registry.inflight.remove(&self.key);
        self.registry.handles.remove(&self.task_id);
    }
}

/// Runs background tasks, at most one per task key at a time.
pub struct BackgroundTaskRunner {
    registry: Arc<Registry>,
    cancel: CancellationToken,
}

impl Default for BackgroundTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTaskRunner {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_STATUS_RETENTION)
    }

    /// A runner that remembers at most `retention` finished statuses.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                statuses: DashMap::new(),
                inflight: DashMap::new(),
                handles: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                retention,
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Start `handler` on `manifest` and return the task id.
    ///
    /// Fails with `TaskAlreadyRunning` while another task holds the same
    /// manifest key, and with `InvalidApiParameters` after shutdown.
    pub fn spawn<H>(&self, handler: Arc<H>, manifest: H::Manifest) -> StorageResult<Uuid>
    where
        H: BackgroundTaskHandler + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(StorageError::invalid_params("task runner is shut down"));
        }

        let key = manifest.task_key();
        let task_id = Uuid::new_v4();
        match self.registry.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                debug!(key = %key, running = %existing.get(), "task already in flight");
                return Err(StorageError::TaskAlreadyRunning(key));
            }
            Entry::Vacant(slot) => {
                slot.insert(task_id);
            }
        }
        self.registry.statuses.insert(task_id, TaskStatus::Pending);

        let mut guard = TaskGuard {
            registry: Arc::clone(&self.registry),
            task_id,
            key,
            status: None,
        };
        let cancel = self.cancel.child_token();
        let name = handler.name();
        // The body waits until its handle is registered so the guard never
        // runs before the handle exists.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            guard.registry.statuses.insert(task_id, TaskStatus::Running);
            let status = tokio::select! {
                _ = cancel.cancelled() => TaskStatus::Cancelled,
                result = handler.execute(manifest) => match result {
                    Ok(()) => TaskStatus::Succeeded,
                    Err(e) => TaskStatus::Failed { message: e.to_string() },
                },
            };
            info!(task = name, %task_id, %status, "background task finished");
            guard.status = Some(status);
        });
        self.registry.handles.insert(task_id, handle);
        let _ = registered_tx.send(());
        Ok(task_id)
    }

    /// Status of a live task, or of one of the most recently finished ones.
    pub fn status(&self, task_id: &Uuid) -> Option<TaskStatus> {
        self.registry.statuses.get(task_id).map(|s| s.value().clone())
    }

    /// Wait for a task to finish and return its final status.
    pub async fn wait(&self, task_id: &Uuid) -> Option<TaskStatus> {
        let joined = match self.registry.handles.remove(task_id) {
            Some((_, handle)) => handle.await,
            None => Ok(()),
        };
        if let Err(e) = joined {
            warn!(%task_id, error = %e, "background task panicked");
            if let Some(mut status) = self.registry.statuses.get_mut(task_id) {
                *status = TaskStatus::Failed {
                    message: e.to_string(),
                };
            }
        }
        self.status(task_id)
    }

    /// Number of tasks currently holding a key.
    pub fn in_flight(&self) -> usize {
        self.registry.inflight.len()
    }

    /// Cancel every running task and wait for them to wind down. Spawning
    /// afterwards fails.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<Uuid> = self.registry.handles.iter().map(|e| *e.key()).collect();
        info!(count = ids.len(), "shutting down background tasks");
        for task_id in ids {
            self.wait(&task_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Debug)]
    struct Job {
        key: &'static str,
        fail: bool,
    }

    impl TaskManifest for Job {
        fn task_key(&self) -> String {
            self.key.to_string()
        }
    }

    /// Blocks every execution until released.
    #[derive(Default)]
    struct Gate {
        release: Notify,
    }

    #[async_trait]
    impl BackgroundTaskHandler for Gate {
        type Manifest = Job;

        fn name(&self) -> &'static str {
            "gate"
        }

        async fn execute(&self, manifest: Job) -> StorageResult<()> {
            self.release.notified().await;
            if manifest.fail {
                Err(StorageError::execution("gate says no"))
            } else {
                Ok(())
            }
        }
    }

    async fn wait_running(runner: &BackgroundTaskRunner, id: &Uuid) {
        for _ in 0..100 {
            if runner.status(id) == Some(TaskStatus::Running) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never started");
    }

    #[tokio::test]
    async fn test_success_and_dedup() {
        let runner = BackgroundTaskRunner::new();
        let gate = Arc::new(Gate::default());

        let id = runner
            .spawn(gate.clone(), Job { key: "vf-1", fail: false })
            .unwrap();
        assert!(matches!(
            runner.spawn(gate.clone(), Job { key: "vf-1", fail: false }),
            Err(StorageError::TaskAlreadyRunning(_))
        ));
        assert_eq!(runner.in_flight(), 1);

        wait_running(&runner, &id).await;
        gate.release.notify_one();
        assert_eq!(runner.wait(&id).await, Some(TaskStatus::Succeeded));
        assert_eq!(runner.in_flight(), 0);

        // The key is free again.
        let again = runner
            .spawn(gate.clone(), Job { key: "vf-1", fail: false })
            .unwrap();
        wait_running(&runner, &again).await;
        gate.release.notify_one();
        assert_eq!(runner.wait(&again).await, Some(TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_failure_status() {
        let runner = BackgroundTaskRunner::new();
        let gate = Arc::new(Gate::default());
        let id = runner
            .spawn(gate.clone(), Job { key: "vf-2", fail: true })
            .unwrap();
        wait_running(&runner, &id).await;
        gate.release.notify_one();
        match runner.wait(&id).await {
            Some(TaskStatus::Failed { message }) => assert!(message.contains("gate says no")),
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(runner.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels() {
        let runner = BackgroundTaskRunner::new();
        let gate = Arc::new(Gate::default());
        let id = runner
            .spawn(gate.clone(), Job { key: "vf-3", fail: false })
            .unwrap();
        wait_running(&runner, &id).await;

        runner.shutdown().await;
        assert_eq!(runner.status(&id), Some(TaskStatus::Cancelled));
        assert_eq!(runner.in_flight(), 0);
        assert!(
            runner
                .spawn(gate, Job { key: "vf-4", fail: false })
                .is_err()
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Running.to_string(), "running");
        assert!(TaskStatus::Cancelled.is_finished());
        assert!(!TaskStatus::Pending.is_finished());
    }

    /// Finishes immediately.
    struct Quick;

    #[async_trait]
    impl BackgroundTaskHandler for Quick {
        type Manifest = Job;

        fn name(&self) -> &'static str {
            "quick"
        }

        async fn execute(&self, _manifest: Job) -> StorageResult<()> {
            Ok(())
        }
    }

    const KEYS: [&str; 5] = ["k-0", "k-1", "k-2", "k-3", "k-4"];

    #[tokio::test]
    async fn test_finished_tasks_release_bookkeeping() {
        let runner = BackgroundTaskRunner::with_retention(2);
        let handler = Arc::new(Quick);
        let ids: Vec<Uuid> = KEYS
            .into_iter()
            .map(|key| runner.spawn(handler.clone(), Job { key, fail: false }).unwrap())
            .collect();

        for _ in 0..200 {
            if runner.registry.handles.is_empty() && runner.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(runner.registry.handles.is_empty());
        assert_eq!(runner.in_flight(), 0);
        assert_eq!(runner.registry.statuses.len(), 2);

        // The newest finished statuses are the ones kept.
        let finished = runner.registry.finished.lock().clone();
        for id in &finished {
            assert_eq!(runner.status(id), Some(TaskStatus::Succeeded));
        }
        let evicted = ids.iter().filter(|id| !finished.contains(id)).count();
        assert_eq!(evicted, 3);
    }

    #[tokio::test]
    async fn test_wait_after_self_cleanup() {
        let runner = BackgroundTaskRunner::new();
        let id = runner
            .spawn(Arc::new(Quick), Job { key: "k-9", fail: false })
            .unwrap();
        for _ in 0..200 {
            if runner.registry.handles.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runner.wait(&id).await, Some(TaskStatus::Succeeded));
    }
}
