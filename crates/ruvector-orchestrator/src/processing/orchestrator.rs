//! Public entry point: submit jobs, query and control tasks

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::providers::DocumentProcessor;
use crate::types::{JobDescriptor, JobKind, RegistryStats, Task, TaskId, TaskStatus, TaskTree, TaskUpdate};

use super::gate::{ConcurrencyGate, GateStats};
use super::hierarchy::HierarchyManager;
use super::registry::TaskRegistry;
use super::stages::StageRunner;

/// Orchestrator statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub tasks: RegistryStats,
    pub gate: GateStats,
}

/// Cloneable handle to one orchestrator instance
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    registry: Arc<TaskRegistry>,
    gate: Arc<ConcurrencyGate>,
    runner: Arc<StageRunner>,
    hierarchy: Arc<HierarchyManager>,
    /// Spawned job workers, pruned on submit
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, processor: Arc<dyn DocumentProcessor>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(TaskRegistry::new());
        let gate = Arc::new(ConcurrencyGate::new(config.processing.max_concurrent_jobs));
        let runner = Arc::new(StageRunner::new(
            registry.clone(),
            gate.clone(),
            processor,
            config.processing.checkpoint_poll_interval(),
        ));
        let hierarchy = Arc::new(HierarchyManager::new(
            registry.clone(),
            gate.clone(),
            runner.clone(),
            &config.processing,
        ));

        tracing::info!(
            "Orchestrator ready: {} concurrent jobs, checkpoint poll {}ms",
            config.processing.max_concurrent_jobs,
            config.processing.checkpoint_poll_ms
        );

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                config,
                registry,
                gate,
                runner,
                hierarchy,
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Accept a job and return its id at once. Work runs in the background
    /// on the current tokio runtime.
    pub fn submit(&self, job: JobDescriptor) -> Result<TaskId> {
        if !job.source.exists() {
            return Err(Error::SourceNotFound(job.source));
        }
        if self.inner.gate.is_closed() {
            return Err(Error::GateClosed);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(e.to_string()))?;

        let kind = job.kind();
        let registry = &self.inner.registry;
        let id = registry.allocate_id();
        registry.create(id)?;
        registry.update(
            id,
            TaskUpdate::new()
                .source_name(job.display_name())
                .batch_parent(kind == JobKind::Batch),
        )?;

        tracing::info!(
            "[{}] Submitted {} job for {}",
            id,
            match kind {
                JobKind::Document => "document",
                JobKind::Batch => "batch",
            },
            job.source.display()
        );

        let handle = match kind {
            JobKind::Document => {
                let runner = self.inner.runner.clone();
                runtime.spawn(async move {
                    runner.run_document(id, job.source, job.options).await;
                })
            }
            JobKind::Batch => {
                let hierarchy = self.inner.hierarchy.clone();
                runtime.spawn(async move {
                    hierarchy.run_batch(id, job.source, job.options).await;
                })
            }
        };

        let mut workers = self.inner.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);

        Ok(id)
    }

    /// Latest snapshot of a task
    pub fn query(&self, id: TaskId) -> Result<Task> {
        self.inner.registry.get(id).ok_or(Error::TaskNotFound(id))
    }

    /// Snapshot of a task together with its children
    pub fn query_tree(&self, id: TaskId) -> Result<TaskTree> {
        self.inner.registry.tree(id)
    }

    /// Ask a Pending or Running task to pause at its next checkpoint
    pub fn pause(&self, id: TaskId) -> Result<bool> {
        self.inner.registry.request_pause(id)
    }

    /// Resume a paused task or withdraw a pause request
    pub fn resume(&self, id: TaskId) -> Result<bool> {
        self.inner.registry.request_resume(id)
    }

    /// Cancel a task. For a batch parent, children that have not started are
    /// cancelled too; a running child finishes on its own.
    pub fn cancel(&self, id: TaskId) -> Result<bool> {
        let cancelled = self.inner.registry.request_cancel(id)?;
        if cancelled {
            let is_parent = self
                .inner
                .registry
                .get(id)
                .map(|task| task.is_batch_parent)
                .unwrap_or(false);
            if is_parent {
                self.inner.hierarchy.cascade_cancel(id);
            }
        }
        Ok(cancelled)
    }

    /// Cancel every task that has not finished. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for task in self.inner.registry.list(None) {
            if !task.is_terminal() && self.cancel(task.id).unwrap_or(false) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!("Cancelled {} tasks", cancelled);
        }
        cancelled
    }

    /// Evict the oldest finished tasks beyond the `keep_recent` most recent
    pub fn cleanup(&self, keep_recent: usize) -> usize {
        self.inner.registry.cleanup(keep_recent)
    }

    /// `cleanup` with the configured retention
    pub fn cleanup_with_retention(&self) -> usize {
        self.cleanup(self.inner.config.retention.keep_recent)
    }

    /// All tasks, optionally filtered by status
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.inner.registry.list(status)
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            tasks: self.inner.registry.stats(),
            gate: self.inner.gate.stats(),
        }
    }

    /// Wait until a task reaches a terminal state and return its snapshot
    pub async fn wait_for(&self, id: TaskId) -> Result<Task> {
        let poll = self
            .inner
            .config
            .processing
            .checkpoint_poll_interval()
            .min(Duration::from_millis(50));
        loop {
            let task = self.query(id)?;
            if task.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stop accepting work, cancel everything in flight and wait for the
    /// workers to unwind.
    pub async fn shutdown(&self) {
        self.inner.gate.close();
        let cancelled = self.cancel_all();

        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        tracing::info!(
            "Shutting down: cancelled {} tasks, waiting for {} workers",
            cancelled,
            workers.len()
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("Worker ended abnormally: {}", e);
            }
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.inner.gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::providers::scripted::{Latch, ScriptedProcessor};
    use crate::providers::PlainTextProcessor;
    use std::path::{Path, PathBuf};
    use tokio_test::assert_ok;

    fn orchestrator(max_concurrent_jobs: usize, processor: Arc<dyn DocumentProcessor>) -> Orchestrator {
        let config = OrchestratorConfig {
            processing: ProcessingConfig {
                max_concurrent_jobs,
                checkpoint_poll_ms: 10,
                ..ProcessingConfig::default()
            },
            ..OrchestratorConfig::default()
        };
        Orchestrator::new(config, processor).unwrap()
    }

    fn write_files(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                std::fs::write(&path, "page one\u{c}page two").unwrap();
                path
            })
            .collect()
    }

    async fn finished(orchestrator: &Orchestrator, id: TaskId) -> Task {
        tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for(id))
            .await
            .expect("task did not finish in time")
            .unwrap()
    }

    async fn wait_until(orchestrator: &Orchestrator, id: TaskId, status: TaskStatus) {
        for _ in 0..400 {
            if orchestrator.query(id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_plain_text_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), &["doc.txt"]);
        let processor = Arc::new(PlainTextProcessor::new());
        let orchestrator = orchestrator(3, processor.clone());

        let id = assert_ok!(orchestrator.submit(JobDescriptor::new(&files[0])));
        let task = finished(&orchestrator, id).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.source_name.as_deref(), Some("doc.txt"));
        assert_eq!(task.total_pages, 2);
        assert_eq!(processor.indexed_pages().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_gate_bounds_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), &["1.txt", "2.txt", "3.txt", "4.txt", "5.txt"]);
        let processor = Arc::new(ScriptedProcessor::new(3).with_delay(Duration::from_millis(15)));
        let orchestrator = orchestrator(3, processor.clone());

        let ids: Vec<TaskId> = files
            .iter()
            .map(|file| orchestrator.submit(JobDescriptor::new(file)).unwrap())
            .collect();

        loop {
            let stats = orchestrator.stats();
            assert!(stats.tasks.running <= 3, "{} running", stats.tasks.running);
            assert!(stats.gate.in_flight <= 3);
            if stats.tasks.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for id in ids {
            let task = orchestrator.query(id).unwrap();
            assert!(matches!(task.status, TaskStatus::Completed | TaskStatus::Failed));
        }
        let stats = orchestrator.stats();
        assert!(stats.gate.peak_in_flight <= 3);
        assert_eq!(stats.gate.total_acquired, 5);
        assert_eq!(stats.gate.in_flight, 0);
        assert!(processor.peak_active() <= 3);
    }

    #[tokio::test]
    async fn test_batch_cancelled_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let batch = dir.path().join("batch");
        std::fs::create_dir(&batch).unwrap();
        write_files(&batch, &["a.txt", "b.txt", "c.txt"]);
        let processor = Arc::new(ScriptedProcessor::new(1));
        let orchestrator = orchestrator(3, processor.clone());

        let parent = orchestrator.submit(JobDescriptor::new(&batch)).unwrap();
        assert!(orchestrator.query(parent).unwrap().is_batch_parent);
        assert!(orchestrator.cancel(parent).unwrap());

        let task = finished(&orchestrator, parent).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        orchestrator.shutdown().await;

        assert!(orchestrator
            .list(None)
            .iter()
            .filter(|t| t.parent_id == Some(parent))
            .all(|t| t.status == TaskStatus::Cancelled));
        assert!(processor.started().is_empty());
    }

    #[tokio::test]
    async fn test_batch_children_are_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("batch.zip");
        super::super::archive::fixtures::write_zip(
            &archive,
            &[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c"), ("d.txt", "d")],
        );
        let orchestrator = orchestrator(2, Arc::new(ScriptedProcessor::new(2)));

        let parent = orchestrator.submit(JobDescriptor::new(&archive)).unwrap();
        let task = finished(&orchestrator, parent).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.is_batch_parent);
        assert_eq!(task.total_files, 4);
        assert_eq!(task.child_ids.len(), 4);
        for child in &task.child_ids {
            let child = orchestrator.query(*child).unwrap();
            assert_eq!(child.status, TaskStatus::Completed);
            assert_eq!(child.parent_id, Some(parent));
        }

        let tree = orchestrator.query_tree(parent).unwrap();
        assert_eq!(tree.children.len(), 4);
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["id"], parent.to_string());
        assert_eq!(json["children"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), &["doc.txt"]);
        let latch = Latch::new();
        let processor = ScriptedProcessor::new(3).holding("doc.txt", latch.clone());
        let orchestrator = orchestrator(1, Arc::new(processor));

        let id = orchestrator.submit(JobDescriptor::new(&files[0])).unwrap();
        // Not paused yet, so resume is refused
        assert!(!orchestrator.resume(id).unwrap());

        latch.wait_entered().await;
        assert!(orchestrator.pause(id).unwrap());
        assert!(orchestrator.query(id).unwrap().pause_requested);
        assert_eq!(orchestrator.query(id).unwrap().status, TaskStatus::Running);

        latch.open();
        wait_until(&orchestrator, id, TaskStatus::Paused).await;
        let paused = orchestrator.query(id).unwrap();
        assert!(!orchestrator.pause(id).unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(orchestrator.query(id).unwrap().processed_pages, paused.processed_pages);

        assert!(orchestrator.resume(id).unwrap());
        assert_eq!(orchestrator.query(id).unwrap().status, TaskStatus::Running);

        let task = finished(&orchestrator, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!task.pause_requested);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), &["doc.txt"]);
        let latch = Latch::new();
        let processor = ScriptedProcessor::new(3).holding("doc.txt", latch.clone());
        let orchestrator = orchestrator(1, Arc::new(processor));

        let id = orchestrator.submit(JobDescriptor::new(&files[0])).unwrap();
        latch.wait_entered().await;

        assert!(orchestrator.cancel(id).unwrap());
        assert_eq!(orchestrator.query(id).unwrap().status, TaskStatus::Cancelled);
        assert!(!orchestrator.cancel(id).unwrap());
        assert!(!orchestrator.pause(id).unwrap());

        latch.open();
        let task = finished(&orchestrator, id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error_message.is_none());

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), &["doc.txt"]);
        let processor = ScriptedProcessor::new(3).failing_on("doc.txt", 3);
        let orchestrator = orchestrator(1, Arc::new(processor));

        let id = orchestrator.submit(JobDescriptor::new(&files[0])).unwrap();
        let task = finished(&orchestrator, id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("injected failure"));
        assert!(task.message.starts_with("Failed"));
        assert_eq!(orchestrator.stats().tasks.failed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_retains_recent_finished() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), &["1.txt", "2.txt", "3.txt", "4.txt"]);
        let orchestrator = orchestrator(3, Arc::new(ScriptedProcessor::new(1)));

        let mut ids = Vec::new();
        for file in &files {
            let id = orchestrator.submit(JobDescriptor::new(file)).unwrap();
            finished(&orchestrator, id).await;
            ids.push(id);
        }

        assert_eq!(orchestrator.cleanup(10), 0);
        assert_eq!(orchestrator.cleanup(1), 3);
        assert!(orchestrator.query(ids[3]).is_ok());
        assert!(matches!(orchestrator.query(ids[0]), Err(Error::TaskNotFound(_))));
        assert_eq!(orchestrator.list(None).len(), 1);
    }

    #[tokio::test]
    async fn test_submit_errors() {
        let orchestrator = orchestrator(1, Arc::new(ScriptedProcessor::new(1)));

        let missing = orchestrator.submit(JobDescriptor::new("/nonexistent/doc.txt"));
        assert!(matches!(missing, Err(Error::SourceNotFound(_))));
        assert!(matches!(
            orchestrator.query(TaskId::Root(42)),
            Err(Error::TaskNotFound(_))
        ));
        assert!(matches!(
            orchestrator.pause(TaskId::Root(42)),
            Err(Error::TaskNotFound(_))
        ));

        orchestrator.shutdown().await;
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), &["doc.txt"]);
        assert!(matches!(
            orchestrator.submit(JobDescriptor::new(&files[0])),
            Err(Error::GateClosed)
        ));
    }

    #[test]
    fn test_submit_requires_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), &["doc.txt"]);
        let orchestrator = orchestrator(1, Arc::new(ScriptedProcessor::new(1)));

        let result = orchestrator.submit(JobDescriptor::new(&files[0]));
        assert!(matches!(result, Err(Error::Runtime(_))));
        assert!(orchestrator.list(None).is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = OrchestratorConfig::default();
        config.processing.max_concurrent_jobs = 0;
        assert!(Orchestrator::new(config, Arc::new(ScriptedProcessor::new(1))).is_err());
    }
}
