//! Task identity, lifecycle and snapshot types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identifier of an orchestrated task.
///
/// Root ids come from the registry's monotonic counter and are never reused.
/// Child ids are derived from the parent root id plus a 1-based sequence
/// number, so they can never collide with a root id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    Root(u64),
    Child(u64, u16),
}

impl TaskId {
    /// Derive the id of the `seq`-th child of this task.
    ///
    /// Only root tasks can have children.
    pub fn child(&self, seq: u16) -> Option<TaskId> {
        match self {
            TaskId::Root(root) => Some(TaskId::Child(*root, seq)),
            TaskId::Child(..) => None,
        }
    }

    /// Parent id encoded in a child id
    pub fn parent(&self) -> Option<TaskId> {
        match self {
            TaskId::Root(_) => None,
            TaskId::Child(root, _) => Some(TaskId::Root(*root)),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Root(root) => write!(f, "task-{}", root),
            TaskId::Child(root, seq) => write!(f, "task-{}.{}", root, seq),
        }
    }
}

/// Error returned when parsing a malformed task id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTaskIdError(String);

impl fmt::Display for ParseTaskIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task id '{}'", self.0)
    }
}

impl std::error::Error for ParseTaskIdError {}

impl FromStr for TaskId {
    type Err = ParseTaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseTaskIdError(s.to_string());
        let body = s.strip_prefix("task-").ok_or_else(invalid)?;

        match body.split_once('.') {
            None => body.parse().map(TaskId::Root).map_err(|_| invalid()),
            Some((root, seq)) => {
                let root = root.parse().map_err(|_| invalid())?;
                let seq = seq.parse().map_err(|_| invalid())?;
                Ok(TaskId::Child(root, seq))
            }
        }
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Task status
///
/// Allowed transitions:
/// - Pending -> Running | Cancelled
/// - Running -> Paused | Cancelled | Completed | Failed
/// - Paused -> Running | Cancelled
///
/// Cancelled, Completed and Failed are final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Cancelled,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled | TaskStatus::Completed | TaskStatus::Failed
        )
    }

    /// Whether `self -> next` is a legal transition. Re-entering the same
    /// non-terminal state is accepted as a no-op.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Initializing,
    ExtractingArchive,
    OcrProcessing,
    VlmExtraction,
    Indexing,
    Finalizing,
}

impl ProcessingStage {
    /// Share of the overall percentage this stage covers, as `(start, end)`.
    pub fn progress_band(&self) -> (u8, u8) {
        match self {
            ProcessingStage::Initializing => (0, 5),
            ProcessingStage::ExtractingArchive => (0, 5),
            ProcessingStage::OcrProcessing => (5, 50),
            ProcessingStage::VlmExtraction => (50, 80),
            ProcessingStage::Indexing => (80, 95),
            ProcessingStage::Finalizing => (95, 100),
        }
    }

    /// Overall percentage after `done` of `total` units of this stage.
    pub fn progress_at(&self, done: u32, total: u32) -> u8 {
        let (start, end) = self.progress_band();
        if total == 0 {
            return start;
        }
        let span = (end - start) as u64;
        let done = done.min(total) as u64;
        start + (span * done / total as u64) as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Initializing => "initializing",
            ProcessingStage::ExtractingArchive => "extracting_archive",
            ProcessingStage::OcrProcessing => "ocr_processing",
            ProcessingStage::VlmExtraction => "vlm_extraction",
            ProcessingStage::Indexing => "indexing",
            ProcessingStage::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control value carried on a task's control channel.
///
/// `Proceed` doubles as the resume signal: anything other than `Pause` lets a
/// parked worker continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskControl {
    Proceed,
    Pause,
    Cancel,
}

/// Timing of one stage a task went through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: ProcessingStage,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Snapshot of one orchestrated job or sub-job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub stage: ProcessingStage,
    pub stage_start_time: Option<DateTime<Utc>>,
    pub stage_end_time: Option<DateTime<Utc>>,
    pub stage_history: Vec<StageRecord>,
    /// Always within 0..=100
    pub progress_percentage: u8,
    pub message: String,
    /// File this task processes (inner file name for batch children)
    pub source_name: Option<String>,

    pub total_pages: u32,
    pub processed_pages: u32,
    pub current_page: u32,

    pub parent_id: Option<TaskId>,
    pub child_ids: Vec<TaskId>,
    pub is_batch_parent: bool,
    pub total_files: u32,
    pub processed_files: u32,

    pub error_message: Option<String>,
    pub error_details: Option<String>,

    pub pause_requested: bool,
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Pending,
            stage: ProcessingStage::Initializing,
            stage_start_time: None,
            stage_end_time: None,
            stage_history: Vec::new(),
            progress_percentage: 0,
            message: "Queued".to_string(),
            source_name: None,
            total_pages: 0,
            processed_pages: 0,
            current_page: 0,
            parent_id: id.parent(),
            child_ids: Vec::new(),
            is_batch_parent: false,
            total_files: 0,
            processed_files: 0,
            error_message: None,
            error_details: None,
            pause_requested: false,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `stage`, closing the timing record of the previous one.
    pub(crate) fn enter_stage(&mut self, stage: ProcessingStage) {
        if self.stage_start_time.is_some() && self.stage == stage {
            return;
        }
        let now = Utc::now();
        self.close_stage(now);
        self.stage = stage;
        self.stage_start_time = Some(now);
        self.stage_end_time = None;
        self.stage_history.push(StageRecord {
            stage,
            started_at: now,
            ended_at: None,
        });
    }

    pub(crate) fn close_stage(&mut self, now: DateTime<Utc>) {
        if self.stage_start_time.is_some() && self.stage_end_time.is_none() {
            self.stage_end_time = Some(now);
        }
        if let Some(record) = self.stage_history.last_mut() {
            if record.ended_at.is_none() {
                record.ended_at = Some(now);
            }
        }
    }

    pub(crate) fn set_progress(&mut self, percentage: i32) {
        self.progress_percentage = percentage.clamp(0, 100) as u8;
    }

    pub(crate) fn apply(&mut self, update: TaskUpdate) {
        if let Some(stage) = update.stage {
            self.enter_stage(stage);
        }
        if let Some(progress) = update.progress {
            self.set_progress(progress);
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        if let Some(source_name) = update.source_name {
            self.source_name = Some(source_name);
        }
        if let Some(total_pages) = update.total_pages {
            self.total_pages = total_pages;
        }
        if let Some(processed_pages) = update.processed_pages {
            self.processed_pages = processed_pages;
        }
        if let Some(current_page) = update.current_page {
            self.current_page = current_page;
        }
        if let Some(is_batch_parent) = update.is_batch_parent {
            self.is_batch_parent = is_batch_parent;
        }
        if let Some(total_files) = update.total_files {
            self.total_files = total_files;
        }
        if let Some(processed_files) = update.processed_files {
            self.processed_files = processed_files;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update applied to a task by `TaskRegistry::update`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub stage: Option<ProcessingStage>,
    /// Clamped to 0..=100 on apply
    pub progress: Option<i32>,
    pub message: Option<String>,
    pub source_name: Option<String>,
    pub total_pages: Option<u32>,
    pub processed_pages: Option<u32>,
    pub current_page: Option<u32>,
    pub is_batch_parent: Option<bool>,
    pub total_files: Option<u32>,
    pub processed_files: Option<u32>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: ProcessingStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn progress(mut self, progress: i32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    pub fn total_pages(mut self, total: u32) -> Self {
        self.total_pages = Some(total);
        self
    }

    pub fn processed_pages(mut self, processed: u32) -> Self {
        self.processed_pages = Some(processed);
        self
    }

    pub fn current_page(mut self, page: u32) -> Self {
        self.current_page = Some(page);
        self
    }

    pub fn batch_parent(mut self, is_batch_parent: bool) -> Self {
        self.is_batch_parent = Some(is_batch_parent);
        self
    }

    pub fn total_files(mut self, total: u32) -> Self {
        self.total_files = Some(total);
        self
    }

    pub fn processed_files(mut self, processed: u32) -> Self {
        self.processed_files = Some(processed);
        self
    }
}

/// How a worker finished a task, reported through `TaskRegistry::complete`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed {
        message: String,
        details: Option<String>,
    },
    Cancelled,
}

/// A task snapshot together with the snapshots of its children
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTree {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskTree>,
}

/// Per-status task counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_tasks: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub cancelled: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RegistryStats {
    pub(crate) fn record(&mut self, status: TaskStatus) {
        self.total_tasks += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Paused => self.paused += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    /// Tasks that have not reached a terminal state
    pub fn in_flight(&self) -> usize {
        self.pending + self.running + self.paused
    }
}
