//! Batch jobs: one parent task fanning out into child tasks
//!
//! The parent extracts its container while holding a gate slot, registers one
//! child per inner document, then runs the children one after another. Each
//! child takes its own slot through the [`StageRunner`]. The parent checkpoints
//! before every child, so pausing it suspends scheduling and cancelling it
//! stops scheduling. A child that already started is never interrupted by its
//! parent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};
use crate::types::{ProcessingOptions, ProcessingStage, TaskId, TaskOutcome, TaskStatus, TaskUpdate};

use super::archive::{self, BatchContents};
use super::checkpoint::TaskContext;
use super::gate::ConcurrencyGate;
use super::registry::TaskRegistry;
use super::stages::StageRunner;

/// Overall batch percentage from finished children plus the running child's
/// own percentage.
pub fn blended_progress(processed_files: u32, total_files: u32, running_child_pct: u8) -> u8 {
    if total_files == 0 {
        return 0;
    }
    let total = total_files as u64;
    let processed = (processed_files as u64).min(total);
    let partial = if processed < total {
        running_child_pct.min(100) as u64
    } else {
        0
    };
    ((processed * 100 + partial) / total).min(100) as u8
}

/// Child registered for one inner document
struct ChildJob {
    id: TaskId,
    file: PathBuf,
    name: String,
}

/// Runs batch parents and their children
pub struct HierarchyManager {
    registry: Arc<TaskRegistry>,
    gate: Arc<ConcurrencyGate>,
    runner: Arc<StageRunner>,
    poll_interval: Duration,
    work_dir: Option<PathBuf>,
    max_batch_files: usize,
}

impl HierarchyManager {
    pub fn new(
        registry: Arc<TaskRegistry>,
        gate: Arc<ConcurrencyGate>,
        runner: Arc<StageRunner>,
        config: &ProcessingConfig,
    ) -> Self {
        Self {
            registry,
            gate,
            runner,
            poll_interval: config.checkpoint_poll_interval(),
            work_dir: config.work_dir.clone(),
            max_batch_files: config.max_batch_files.min(u16::MAX as usize),
        }
    }

    /// Run a batch parent to a terminal state and return that state.
    pub async fn run_batch(
        &self,
        parent: TaskId,
        source: PathBuf,
        options: ProcessingOptions,
    ) -> TaskStatus {
        let mut ctx = match TaskContext::new(self.registry.clone(), parent, self.poll_interval) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!("[{}] Batch not started: {}", parent, e);
                return TaskStatus::Cancelled;
            }
        };

        self.registry.report(
            parent,
            TaskUpdate::new()
                .batch_parent(true)
                .message("Waiting for a processing slot"),
        );

        // The parent holds a slot only while extracting
        let permit = match ctx.acquire_slot(&self.gate).await {
            Ok(Some(permit)) => permit,
            Ok(None) => {
                tracing::info!("[{}] Batch cancelled while queued", parent);
                return self.registry.finish(parent, TaskOutcome::Cancelled);
            }
            Err(e) => {
                tracing::warn!("[{}] Batch not started: {}", parent, e);
                return self.registry.finish(parent, TaskOutcome::Cancelled);
            }
        };

        match self.registry.mark_running(parent) {
            Ok(true) => {}
            _ => return self.registry.status_or_cancelled(parent),
        }

        self.registry.report(
            parent,
            TaskUpdate::new()
                .stage(ProcessingStage::ExtractingArchive)
                .message(format!("Opening {}", source.display())),
        );
        let opened = {
            let source = source.clone();
            let work_dir = self.work_dir.clone();
            let max_files = self.max_batch_files;
            tokio::task::spawn_blocking(move || {
                archive::open_batch(&source, work_dir.as_deref(), max_files)
            })
            .await
        };
        let contents = match opened {
            Ok(Ok(contents)) => contents,
            Ok(Err(e)) => return self.fail(parent, e),
            Err(e) => return self.fail(parent, e.into()),
        };
        drop(permit);

        let total = contents.len() as u32;
        tracing::info!(
            "[{}] Batch {} holds {} documents",
            parent,
            source.display(),
            total
        );
        self.registry.report(
            parent,
            TaskUpdate::new()
                .total_files(total)
                .processed_files(0)
                .message(format!("{} documents found", total)),
        );

        let children = match self.register_children(parent, &contents) {
            Ok(children) => children,
            Err(Error::ParentFinished(_)) => {
                self.cascade_cancel(parent);
                return self.registry.finish(parent, TaskOutcome::Cancelled);
            }
            Err(e) => {
                self.cascade_cancel(parent);
                return self.fail(parent, e);
            }
        };

        let mut processed = 0u32;
        let mut interrupted = false;
        for (index, child) in children.iter().enumerate() {
            if !ctx.checkpoint().await {
                interrupted = true;
                break;
            }

            self.registry.report(
                parent,
                TaskUpdate::new().message(format!(
                    "Processing file {}/{}: {}",
                    index + 1,
                    total,
                    child.name
                )),
            );
            let status = self
                .runner
                .run_document(child.id, child.file.clone(), options.clone())
                .await;
            tracing::info!("[{}] {} ({}) finished: {}", parent, child.id, child.name, status);

            processed += 1;
            self.registry
                .report(parent, TaskUpdate::new().processed_files(processed));
        }

        if interrupted || ctx.is_cancelled() {
            self.cascade_cancel(parent);
            release(contents).await;
            return self.registry.finish(parent, TaskOutcome::Cancelled);
        }

        self.registry.report(
            parent,
            TaskUpdate::new()
                .stage(ProcessingStage::Finalizing)
                .message(format!("Processed {} documents", processed)),
        );
        release(contents).await;
        self.registry.finish(parent, TaskOutcome::Completed)
    }

    fn register_children(&self, parent: TaskId, contents: &BatchContents) -> Result<Vec<ChildJob>> {
        let mut children = Vec::with_capacity(contents.len());

        for (index, file) in contents.files().iter().enumerate() {
            let seq = u16::try_from(index + 1).map_err(|_| Error::TooManyFiles {
                count: contents.len(),
                max: u16::MAX as usize,
            })?;
            let name = contents.display_name(file);
            let child = self.registry.create_child(parent, seq, name.clone())?;

            children.push(ChildJob {
                id: child.id,
                file: file.clone(),
                name,
            });
        }

        tracing::debug!("[{}] Registered {} children", parent, children.len());
        Ok(children)
    }

    /// Cancel every child of `parent` that has not started yet.
    /// Returns how many were cancelled.
    pub fn cascade_cancel(&self, parent: TaskId) -> usize {
        match self.registry.cancel_pending_children(parent) {
            Ok(cancelled) => {
                if cancelled > 0 {
                    tracing::info!("[{}] Cancelled {} pending children", parent, cancelled);
                }
                cancelled
            }
            Err(e) => {
                tracing::debug!("[{}] No children to cancel: {}", parent, e);
                0
            }
        }
    }

    fn fail(&self, parent: TaskId, error: Error) -> TaskStatus {
        tracing::error!("[{}] Batch failed: {}", parent, error);
        let details = format!("stage={}: {}", ProcessingStage::ExtractingArchive, error);
        self.registry.finish(
            parent,
            TaskOutcome::Failed {
                message: error.to_string(),
                details: Some(details),
            },
        )
    }
}

/// Remove extracted files off the async workers
async fn release(contents: BatchContents) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(contents)).await {
        tracing::warn!("Failed to remove batch scratch directory: {}", e);
    }
}
