//! Task orchestration: registry, checkpoints, concurrency gate and workers

mod archive;
mod checkpoint;
mod gate;
mod hierarchy;
mod orchestrator;
mod registry;
mod stages;

pub use archive::{is_archive, open_batch, BatchContents};
pub use checkpoint::TaskContext;
pub use gate::{ConcurrencyGate, GatePermit, GateStats};
pub use hierarchy::{blended_progress, HierarchyManager};
pub use orchestrator::{Orchestrator, OrchestratorStats};
pub use registry::TaskRegistry;
pub use stages::StageRunner;
