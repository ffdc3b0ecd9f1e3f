//! Cooperative checkpoints
//!
//! Workers call [`TaskContext::checkpoint`] between units of work. Pause and
//! cancel requests are only ever honored here, so their latency is bounded by
//! one unit of work.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Result;
use crate::types::{TaskControl, TaskId};

use super::gate::{ConcurrencyGate, GatePermit};
use super::registry::TaskRegistry;

/// Cancellation context threaded through every stage of one task
pub struct TaskContext {
    registry: Arc<TaskRegistry>,
    id: TaskId,
    control: watch::Receiver<TaskControl>,
    poll_interval: Duration,
}

impl TaskContext {
    pub fn new(registry: Arc<TaskRegistry>, id: TaskId, poll_interval: Duration) -> Result<Self> {
        let control = registry.control_receiver(id)?;
        Ok(Self {
            registry,
            id,
            control,
            poll_interval,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.control.borrow() == TaskControl::Cancel
    }

    /// Honor pending control requests.
    ///
    /// Returns `true` when the caller may continue and `false` when it must
    /// unwind. A pause parks the task (status Paused) until it is resumed or
    /// cancelled, re-checking every poll interval.
    pub async fn checkpoint(&mut self) -> bool {
        let mut paused = false;

        loop {
            let control = *self.control.borrow_and_update();
            match control {
                TaskControl::Cancel => {
                    tracing::debug!("[{}] Cancellation observed at checkpoint", self.id);
                    return false;
                }
                TaskControl::Proceed => {
                    if paused {
                        if let Err(e) = self.registry.leave_pause(self.id) {
                            tracing::debug!("[{}] Leaving pause failed: {}", self.id, e);
                            return false;
                        }
                        tracing::info!("[{}] Resumed", self.id);
                    }
                    return true;
                }
                TaskControl::Pause => {
                    if !paused {
                        if let Err(e) = self.registry.enter_pause(self.id) {
                            tracing::debug!("[{}] Entering pause failed: {}", self.id, e);
                            return false;
                        }
                        paused = true;
                    }

                    match tokio::time::timeout(self.poll_interval, self.control.changed()).await {
                        Ok(Ok(())) => {}
                        // Control sender gone: the task was evicted
                        Ok(Err(_)) => return false,
                        Err(_) => {
                            if !self.registry.contains(self.id) {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Wait for a gate slot while the task is still Pending.
    ///
    /// A pause requested while queued keeps the task out of the gate queue
    /// until it is resumed, so a queued pause never occupies a slot. Returns
    /// `Ok(None)` when the task is cancelled (or evicted) before a slot frees.
    pub async fn acquire_slot(&mut self, gate: &ConcurrencyGate) -> Result<Option<GatePermit>> {
        loop {
            if !self.hold_while_paused().await {
                return Ok(None);
            }

            tokio::select! {
                biased;
                _ = self.interrupted() => {}
                permit = gate.acquire() => return permit.map(Some),
            }
        }
    }

    /// Park a queued task while its pause request stands.
    /// Returns false on cancel.
    async fn hold_while_paused(&mut self) -> bool {
        let mut held = false;
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                TaskControl::Cancel => return false,
                TaskControl::Proceed => {
                    if held {
                        tracing::debug!("[{}] Pause withdrawn, queuing for a slot", self.id);
                    }
                    return true;
                }
                TaskControl::Pause => {
                    if !held {
                        tracing::debug!("[{}] Paused while queued", self.id);
                        held = true;
                    }
                    if self.control.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Resolves once any pause or cancel request is published
    async fn interrupted(&mut self) {
        loop {
            if *self.control.borrow_and_update() != TaskControl::Proceed {
                return;
            }
            if self.control.changed().await.is_err() {
                return;
            }
        }
    }
}
