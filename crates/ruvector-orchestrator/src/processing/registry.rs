//! In-memory task registry
//!
//! The registry is the single source of truth for task state. One mutex
//! serializes every mutation and is only held for field updates, never across
//! an `.await` or blocking I/O. Readers always get a cloned snapshot.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::types::{
    RegistryStats, Task, TaskControl, TaskId, TaskOutcome, TaskStatus, TaskTree, TaskUpdate,
};

use super::hierarchy::blended_progress;

/// Task record plus the sending half of its control channel
struct TaskEntry {
    task: Task,
    control: watch::Sender<TaskControl>,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        let (control, _) = watch::channel(TaskControl::Proceed);
        Self { task, control }
    }

    fn control(&self) -> TaskControl {
        *self.control.borrow()
    }

    /// Publish a control value; wakes every worker waiting on the channel.
    fn set_control(&mut self, control: TaskControl) {
        self.control.send_replace(control);
        self.task.pause_requested = control == TaskControl::Pause;
        self.task.cancel_requested = control == TaskControl::Cancel;
        self.task.updated_at = Utc::now();
    }

    fn cancel(&mut self, now: DateTime<Utc>) {
        self.set_control(TaskControl::Cancel);
        self.task.message = "Cancelled".to_string();
        self.finish(TaskStatus::Cancelled, now);
    }

    fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.task.status = status;
        self.task.finished_at = Some(now);
        self.task.close_stage(now);
        self.task.updated_at = now;
    }
}

/// Registry of all tasks known to an orchestrator
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    next_root: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_root: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh root id. Ids are never handed out twice.
    pub fn allocate_id(&self) -> TaskId {
        TaskId::Root(self.next_root.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a new Pending task
    pub fn create(&self, id: TaskId) -> Result<Task> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&id) {
            return Err(Error::DuplicateTask(id));
        }

        if let TaskId::Root(root) = id {
            self.next_root.fetch_max(root + 1, Ordering::SeqCst);
        }

        let entry = TaskEntry::new(Task::new(id));
        let snapshot = entry.task.clone();
        tasks.insert(id, entry);
        tracing::debug!("Registered task {}", id);
        Ok(snapshot)
    }

    /// Get a snapshot of a task
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().get(&id).map(|e| e.task.clone())
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    /// Current control value of a task
    pub fn control(&self, id: TaskId) -> Option<TaskControl> {
        self.tasks.lock().get(&id).map(|e| e.control())
    }

    /// Subscribe to a task's control channel
    pub fn control_receiver(&self, id: TaskId) -> Result<watch::Receiver<TaskControl>> {
        self.tasks
            .lock()
            .get(&id)
            .map(|e| e.control.subscribe())
            .ok_or(Error::TaskNotFound(id))
    }

    /// Apply a partial update.
    ///
    /// Updates to terminal tasks are ignored and the final snapshot is
    /// returned, so a worker finishing its last unit after a cancel cannot
    /// overwrite the outcome. Child progress is folded into the parent.
    pub fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if entry.task.is_terminal() {
            return Ok(entry.task.clone());
        }

        entry.task.apply(update);
        let snapshot = entry.task.clone();

        if let Some(parent) = snapshot.parent_id {
            refresh_parent_progress(&mut tasks, parent, snapshot.progress_percentage);
        } else if snapshot.is_batch_parent {
            refresh_parent_progress(&mut tasks, id, 0);
        }

        Ok(snapshot)
    }

    /// Pending -> Running. Returns false when the task may not start
    /// (cancelled while queued, or already started).
    pub fn mark_running(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if entry.task.status != TaskStatus::Pending || entry.control() == TaskControl::Cancel {
            return Ok(false);
        }

        entry.task.status = TaskStatus::Running;
        entry.task.message = "Running".to_string();
        entry.task.updated_at = Utc::now();
        Ok(true)
    }

    /// Running -> Paused, performed by a worker at a checkpoint
    pub fn enter_pause(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if entry.task.status != TaskStatus::Running || entry.control() != TaskControl::Pause {
            return Ok(false);
        }

        entry.task.status = TaskStatus::Paused;
        entry.task.message = "Paused".to_string();
        entry.task.updated_at = Utc::now();
        tracing::info!("Task {} paused at checkpoint", id);
        Ok(true)
    }

    /// Paused -> Running, performed by a worker leaving a pause-wait
    pub fn leave_pause(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if entry.task.status != TaskStatus::Paused || entry.control() != TaskControl::Proceed {
            return Ok(false);
        }

        entry.task.status = TaskStatus::Running;
        entry.task.message = "Resumed".to_string();
        entry.task.updated_at = Utc::now();
        Ok(true)
    }

    /// Ask a Pending or Running task to pause at its next checkpoint.
    /// Never blocks and does not change the status itself.
    pub fn request_pause(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        match entry.task.status {
            TaskStatus::Pending | TaskStatus::Running => {
                entry.set_control(TaskControl::Pause);
                tracing::info!("Pause requested for task {}", id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release a paused task (or withdraw a pause request)
    pub fn request_resume(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if entry.task.is_terminal() {
            return Ok(false);
        }
        if entry.task.status != TaskStatus::Paused && entry.control() != TaskControl::Pause {
            return Ok(false);
        }

        entry.set_control(TaskControl::Proceed);
        if entry.task.status == TaskStatus::Paused {
            entry.task.status = TaskStatus::Running;
            entry.task.message = "Resumed".to_string();
        }
        tracing::info!("Resume requested for task {}", id);
        Ok(true)
    }

    /// Cancel any non-terminal task.
    ///
    /// The status becomes Cancelled immediately. The worker may still be
    /// inside a unit of work and will observe the cancel at its next
    /// checkpoint; a worker parked in a pause-wait is woken by the control
    /// change.
    pub fn request_cancel(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if entry.task.is_terminal() {
            return Ok(false);
        }

        entry.cancel(Utc::now());
        tracing::info!("Task {} cancelled", id);
        Ok(true)
    }

    /// Cancel every child of `parent` that is still Pending, under one lock.
    /// Children that already started are left alone. Returns how many were
    /// cancelled.
    pub fn cancel_pending_children(&self, parent: TaskId) -> Result<usize> {
        let mut tasks = self.tasks.lock();
        let child_ids = tasks
            .get(&parent)
            .ok_or(Error::TaskNotFound(parent))?
            .task
            .child_ids
            .clone();

        let now = Utc::now();
        let mut cancelled = 0;
        for child in child_ids {
            if let Some(entry) = tasks.get_mut(&child) {
                if entry.task.status == TaskStatus::Pending {
                    entry.cancel(now);
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }

    /// Record the terminal outcome reported by a worker.
    ///
    /// A requested cancellation always wins over the reported outcome. If the
    /// task is already terminal its final status is returned unchanged.
    pub fn complete(&self, id: TaskId, outcome: TaskOutcome) -> Result<TaskStatus> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if entry.task.is_terminal() {
            return Ok(entry.task.status);
        }

        let outcome = if entry.control() == TaskControl::Cancel {
            TaskOutcome::Cancelled
        } else {
            outcome
        };
        let status = match &outcome {
            TaskOutcome::Completed => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
        };
        if !entry.task.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                id,
                from: entry.task.status,
                to: status,
            });
        }

        match outcome {
            TaskOutcome::Completed => {
                entry.task.progress_percentage = 100;
                entry.task.message = "Completed".to_string();
                entry.set_control(TaskControl::Proceed);
            }
            TaskOutcome::Failed { message, details } => {
                entry.task.message = format!("Failed: {}", message);
                entry.task.error_message = Some(message);
                entry.task.error_details = details;
                entry.set_control(TaskControl::Proceed);
            }
            TaskOutcome::Cancelled => {
                entry.task.message = "Cancelled".to_string();
                entry.set_control(TaskControl::Cancel);
            }
        }
        entry.finish(status, Utc::now());

        let snapshot = entry.task.clone();
        if let Some(parent) = snapshot.parent_id {
            refresh_parent_progress(&mut tasks, parent, snapshot.progress_percentage);
        }

        Ok(status)
    }

    /// Apply a progress update on behalf of a worker.
    ///
    /// Progress writes never fail the task. A missing task was evicted after
    /// being cancelled, which the worker's next checkpoint notices.
    pub(crate) fn report(&self, id: TaskId, update: TaskUpdate) {
        if let Err(e) = self.update(id, update) {
            tracing::debug!("[{}] Dropped progress update: {}", id, e);
        }
    }

    /// Record a worker's outcome and return the final status
    pub(crate) fn finish(&self, id: TaskId, outcome: TaskOutcome) -> TaskStatus {
        match self.complete(id, outcome) {
            Ok(status) => {
                tracing::info!("[{}] Finished: {}", id, status);
                status
            }
            Err(e) => {
                tracing::warn!("[{}] Could not record outcome: {}", id, e);
                self.status_or_cancelled(id)
            }
        }
    }

    /// Current status; evicted tasks count as cancelled
    pub(crate) fn status_or_cancelled(&self, id: TaskId) -> TaskStatus {
        self.get(id)
            .map(|task| task.status)
            .unwrap_or(TaskStatus::Cancelled)
    }

    /// Link `child` under `parent`. The parent's child list only grows.
    pub fn add_child(&self, parent: TaskId, child: TaskId) -> Result<()> {
        let mut tasks = self.tasks.lock();
        ensure_open_parent(&tasks, parent)?;

        let child_entry = tasks.get_mut(&child).ok_or(Error::TaskNotFound(child))?;
        child_entry.task.parent_id = Some(parent);

        let parent_entry = tasks.get_mut(&parent).ok_or(Error::TaskNotFound(parent))?;
        if !parent_entry.task.child_ids.contains(&child) {
            parent_entry.task.child_ids.push(child);
        }
        parent_entry.task.is_batch_parent = true;
        parent_entry.task.updated_at = Utc::now();
        Ok(())
    }

    /// Register the `seq`-th child of `parent` as Pending and link it, in one
    /// step. Once the parent is terminal this fails with `ParentFinished` and
    /// nothing is registered.
    pub fn create_child(&self, parent: TaskId, seq: u16, source_name: String) -> Result<Task> {
        let id = parent
            .child(seq)
            .ok_or_else(|| Error::internal(format!("{} cannot have children", parent)))?;
        let mut tasks = self.tasks.lock();
        ensure_open_parent(&tasks, parent)?;
        if tasks.contains_key(&id) {
            return Err(Error::DuplicateTask(id));
        }

        let mut entry = TaskEntry::new(Task::new(id));
        entry.task.source_name = Some(source_name);
        let snapshot = entry.task.clone();
        tasks.insert(id, entry);

        let parent_entry = tasks.get_mut(&parent).ok_or(Error::TaskNotFound(parent))?;
        parent_entry.task.child_ids.push(id);
        parent_entry.task.is_batch_parent = true;
        parent_entry.task.updated_at = Utc::now();
        Ok(snapshot)
    }

    /// Snapshots of a task's children, in creation order
    pub fn children(&self, id: TaskId) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock();
        let entry = tasks.get(&id).ok_or(Error::TaskNotFound(id))?;
        Ok(entry
            .task
            .child_ids
            .iter()
            .filter_map(|child| tasks.get(child).map(|e| e.task.clone()))
            .collect())
    }

    /// Snapshot of a task and its whole child tree.
    /// Children that were already evicted are left out.
    pub fn tree(&self, id: TaskId) -> Result<TaskTree> {
        let tasks = self.tasks.lock();
        build_tree(&tasks, id).ok_or(Error::TaskNotFound(id))
    }

    /// All tasks, optionally filtered by status, oldest first
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.tasks.lock();
        let mut list: Vec<Task> = tasks
            .values()
            .filter(|e| status.map_or(true, |s| e.task.status == s))
            .map(|e| e.task.clone())
            .collect();
        drop(tasks);

        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Per-status counts
    pub fn stats(&self) -> RegistryStats {
        let tasks = self.tasks.lock();
        let mut stats = RegistryStats::default();
        for entry in tasks.values() {
            stats.record(entry.task.status);
        }
        stats
    }

    /// Evict the oldest finished tasks, keeping the `keep_recent` most
    /// recently finished ones. In-flight tasks are never touched.
    /// Returns the number of evicted tasks.
    pub fn cleanup(&self, keep_recent: usize) -> usize {
        let mut tasks = self.tasks.lock();

        let mut finished: Vec<(DateTime<Utc>, TaskId)> = tasks
            .values()
            .filter(|e| e.task.is_terminal())
            .map(|e| (e.task.finished_at.unwrap_or(e.task.updated_at), e.task.id))
            .collect();
        if finished.len() <= keep_recent {
            return 0;
        }

        // Most recently finished first
        finished.sort_by(|a, b| b.cmp(a));
        let evicted: Vec<TaskId> = finished
            .into_iter()
            .skip(keep_recent)
            .map(|(_, id)| id)
            .collect();
        for id in &evicted {
            tasks.remove(id);
        }
        drop(tasks);

        tracing::info!(
            "Evicted {} finished tasks (keeping {} most recent)",
            evicted.len(),
            keep_recent
        );
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Raise a batch parent's percentage to the blended value. Never lowers it.
fn refresh_parent_progress(
    tasks: &mut HashMap<TaskId, TaskEntry>,
    parent: TaskId,
    running_child_pct: u8,
) {
    let Some(entry) = tasks.get_mut(&parent) else {
        return;
    };
    let task = &mut entry.task;
    if task.is_terminal() || task.total_files == 0 {
        return;
    }

    let blended = blended_progress(task.processed_files, task.total_files, running_child_pct);
    if blended > task.progress_percentage {
        task.progress_percentage = blended;
        task.updated_at = Utc::now();
    }
}

fn ensure_open_parent(tasks: &HashMap<TaskId, TaskEntry>, parent: TaskId) -> Result<()> {
    match tasks.get(&parent) {
        None => Err(Error::TaskNotFound(parent)),
        Some(entry) if entry.task.is_terminal() => Err(Error::ParentFinished(parent)),
        Some(_) => Ok(()),
    }
}

fn build_tree(tasks: &HashMap<TaskId, TaskEntry>, id: TaskId) -> Option<TaskTree> {
    let entry = tasks.get(&id)?;
    let children = entry
        .task
        .child_ids
        .iter()
        .filter_map(|child| build_tree(tasks, *child))
        .collect();
    Some(TaskTree {
        task: entry.task.clone(),
        children,
    })
}
