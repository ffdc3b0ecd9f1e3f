//! ruvector-orchestrator: background orchestration for document-processing jobs
//!
//! Jobs are accepted immediately and run on tokio workers. Every job is
//! tracked as a task with fine-grained progress and can be paused, resumed or
//! cancelled at page granularity. Archives and directories become batch jobs:
//! one parent task plus one child task per inner document.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ruvector_orchestrator::{JobDescriptor, Orchestrator, OrchestratorConfig, PlainTextProcessor};
//!
//! # async fn run() -> ruvector_orchestrator::Result<()> {
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(PlainTextProcessor::new()),
//! )?;
//! let id = orchestrator.submit(JobDescriptor::new("reports.zip"))?;
//! let task = orchestrator.wait_for(id).await?;
//! println!("{} finished: {}", id, task.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod processing;
pub mod providers;
pub mod types;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use processing::{Orchestrator, OrchestratorStats, TaskRegistry};
pub use providers::{DocumentProcessor, PageContent, PlainTextProcessor};
pub use types::{
    JobDescriptor, JobKind, ProcessingOptions, ProcessingStage, Task, TaskId, TaskStatus, TaskTree,
};
