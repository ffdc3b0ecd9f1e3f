//! Core types for the orchestrator

pub mod job;
pub mod task;

pub use job::{JobDescriptor, JobKind, ProcessingOptions};
pub use task::{
    ParseTaskIdError, ProcessingStage, RegistryStats, StageRecord, Task, TaskControl, TaskId,
    TaskOutcome, TaskStatus, TaskTree, TaskUpdate,
};
