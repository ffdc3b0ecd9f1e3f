//! Per-document stage pipeline
//!
//! Initializing → OCR → VLM refinement → Indexing → Finalizing, with a
//! checkpoint before every page of every stage. Collaborator calls run on the
//! blocking pool while the task holds one gate slot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::providers::{DocumentProcessor, PageContent};
use crate::types::{ProcessingOptions, ProcessingStage, TaskId, TaskOutcome, TaskStatus, TaskUpdate};

use super::checkpoint::TaskContext;
use super::gate::ConcurrencyGate;
use super::registry::TaskRegistry;

/// Where and why a stage failed
struct StageFailure {
    stage: ProcessingStage,
    page: Option<u32>,
    error: Error,
}

impl StageFailure {
    fn into_outcome(self) -> TaskOutcome {
        let location = match self.page {
            Some(page) => format!("stage={} page={}", self.stage, page),
            None => format!("stage={}", self.stage),
        };
        let chain = match &self.error {
            Error::Processor(e) => format!("{:#}", e),
            other => other.to_string(),
        };

        TaskOutcome::Failed {
            message: self.error.to_string(),
            details: Some(format!("{}: {}", location, chain)),
        }
    }
}

type StageResult<T> = std::result::Result<T, StageFailure>;

/// Drives single documents through the processing stages
pub struct StageRunner {
    registry: Arc<TaskRegistry>,
    gate: Arc<ConcurrencyGate>,
    processor: Arc<dyn DocumentProcessor>,
    poll_interval: Duration,
}

impl StageRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        gate: Arc<ConcurrencyGate>,
        processor: Arc<dyn DocumentProcessor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            gate,
            processor,
            poll_interval,
        }
    }

    /// Run one document task to a terminal state and return that state.
    pub async fn run_document(
        &self,
        id: TaskId,
        source: PathBuf,
        options: ProcessingOptions,
    ) -> TaskStatus {
        let mut ctx = match TaskContext::new(self.registry.clone(), id, self.poll_interval) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!("[{}] Not started: {}", id, e);
                return TaskStatus::Cancelled;
            }
        };

        self.registry.report(id, TaskUpdate::new().message("Waiting for a processing slot"));

        let permit = match ctx.acquire_slot(&self.gate).await {
            Ok(Some(permit)) => permit,
            Ok(None) => {
                tracing::info!("[{}] Cancelled while queued", id);
                return self.registry.finish(id, TaskOutcome::Cancelled);
            }
            Err(e) => {
                tracing::warn!("[{}] Not started: {}", id, e);
                return self.registry.finish(id, TaskOutcome::Cancelled);
            }
        };

        match self.registry.mark_running(id) {
            Ok(true) => {}
            _ => return self.registry.status_or_cancelled(id),
        }
        tracing::info!(
            "[{}] Processing {} with {} ({} of {} slots in use)",
            id,
            source.display(),
            self.processor.name(),
            self.gate.in_flight(),
            self.gate.capacity()
        );

        let outcome = match self.run_stages(&mut ctx, Arc::new(source), &options).await {
            Ok(true) => TaskOutcome::Completed,
            Ok(false) => TaskOutcome::Cancelled,
            Err(failure) => {
                tracing::error!(
                    "[{}] Failed in {}: {}",
                    id,
                    failure.stage,
                    failure.error
                );
                failure.into_outcome()
            }
        };

        // Record the outcome before the slot is handed to the next job
        let status = self.registry.finish(id, outcome);
        drop(permit);
        status
    }

    /// Returns Ok(false) when a checkpoint asked the task to stop.
    async fn run_stages(
        &self,
        ctx: &mut TaskContext,
        source: Arc<PathBuf>,
        options: &ProcessingOptions,
    ) -> StageResult<bool> {
        let id = ctx.id();

        self.registry.report(
            id,
            TaskUpdate::new()
                .stage(ProcessingStage::Initializing)
                .progress(0)
                .message("Inspecting document"),
        );
        if !ctx.checkpoint().await {
            return Ok(false);
        }
        let total = {
            let source = source.clone();
            self.blocking(ProcessingStage::Initializing, None, move |p| {
                p.page_count(&source)
            })
            .await?
        };
        let total = options.max_pages.map_or(total, |max| total.min(max));
        self.registry.report(
            id,
            TaskUpdate::new()
                .total_pages(total)
                .progress(ProcessingStage::Initializing.progress_band().1 as i32)
                .message(format!("{} pages", total)),
        );

        // OCR
        self.enter_stage(id, ProcessingStage::OcrProcessing, "Running OCR");
        let mut pages: Vec<PageContent> = Vec::with_capacity(total as usize);
        for page in 1..=total {
            if !ctx.checkpoint().await {
                return Ok(false);
            }
            self.registry.report(
                id,
                TaskUpdate::new()
                    .current_page(page)
                    .message(format!("OCR page {}/{}", page, total)),
            );
            let source = source.clone();
            let content = self
                .blocking(ProcessingStage::OcrProcessing, Some(page), move |p| {
                    p.ocr_page(&source, page)
                })
                .await?;
            pages.push(content);
            self.page_done(id, ProcessingStage::OcrProcessing, page, total);
        }

        // VLM refinement
        if options.vlm_refinement {
            self.enter_stage(id, ProcessingStage::VlmExtraction, "Refining with VLM");
            let mut refined = Vec::with_capacity(pages.len());
            for (content, page) in pages.into_iter().zip(1u32..) {
                if !ctx.checkpoint().await {
                    return Ok(false);
                }
                self.registry.report(
                    id,
                    TaskUpdate::new()
                        .current_page(page)
                        .message(format!("Refining page {}/{}", page, total)),
                );
                let source = source.clone();
                let content = self
                    .blocking(ProcessingStage::VlmExtraction, Some(page), move |p| {
                        p.refine_page(&source, content)
                    })
                    .await?;
                refined.push(content);
                self.page_done(id, ProcessingStage::VlmExtraction, page, total);
            }
            pages = refined;
        } else {
            tracing::debug!("[{}] VLM refinement disabled", id);
        }

        // Indexing
        self.enter_stage(id, ProcessingStage::Indexing, "Indexing");
        for (content, page) in pages.into_iter().zip(1u32..) {
            if !ctx.checkpoint().await {
                return Ok(false);
            }
            self.registry.report(
                id,
                TaskUpdate::new()
                    .current_page(page)
                    .message(format!("Indexing page {}/{}", page, total)),
            );
            let source = source.clone();
            self.blocking(ProcessingStage::Indexing, Some(page), move |p| {
                p.index_page(&source, &content)
            })
            .await?;
            self.page_done(id, ProcessingStage::Indexing, page, total);
        }

        // Finalizing
        if !ctx.checkpoint().await {
            return Ok(false);
        }
        self.enter_stage(id, ProcessingStage::Finalizing, "Finalizing");
        self.blocking(ProcessingStage::Finalizing, None, move |p| {
            p.finalize(&source, total)
        })
        .await?;

        Ok(true)
    }

    /// Run one collaborator call on the blocking pool
    async fn blocking<T, F>(
        &self,
        stage: ProcessingStage,
        page: Option<u32>,
        f: F,
    ) -> StageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DocumentProcessor) -> anyhow::Result<T> + Send + 'static,
    {
        let processor = self.processor.clone();
        match tokio::task::spawn_blocking(move || f(&*processor)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StageFailure {
                stage,
                page,
                error: Error::Processor(e),
            }),
            Err(e) => Err(StageFailure {
                stage,
                page,
                error: e.into(),
            }),
        }
    }

    fn enter_stage(&self, id: TaskId, stage: ProcessingStage, message: &str) {
        tracing::debug!("[{}] Entering {}", id, stage);
        let mut update = TaskUpdate::new()
            .stage(stage)
            .progress(stage.progress_band().0 as i32)
            .message(message);
        // Finalizing keeps the page counters of the last page stage
        if stage != ProcessingStage::Finalizing {
            update = update.processed_pages(0).current_page(0);
        }
        self.registry.report(id, update);
    }

    fn page_done(&self, id: TaskId, stage: ProcessingStage, page: u32, total: u32) {
        self.registry.report(
            id,
            TaskUpdate::new()
                .processed_pages(page)
                .progress(stage.progress_at(page, total) as i32),
        );
    }
}
