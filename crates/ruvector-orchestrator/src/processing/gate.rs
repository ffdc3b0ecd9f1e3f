//! Concurrency gate bounding jobs in their heavy stage

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

#[derive(Default)]
struct GateCounters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    total_acquired: AtomicU64,
}

/// Gate instrumentation snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    pub capacity: usize,
    pub available: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub total_acquired: u64,
}

/// Counting semaphore with acquire/release instrumentation
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<GateCounters>,
}

/// One gate slot. Released when dropped.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(GateCounters::default()),
        }
    }

    /// Wait for a free slot. Fails only once the gate is closed.
    pub async fn acquire(&self) -> Result<GatePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::GateClosed)?;
        Ok(self.track(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<GatePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.track(permit))
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> GatePermit {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.counters.total_acquired.fetch_add(1, Ordering::SeqCst);
        GatePermit {
            _permit: permit,
            counters: self.counters.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn total_acquired(&self) -> u64 {
        self.counters.total_acquired.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            capacity: self.capacity,
            available: self.available(),
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight(),
            total_acquired: self.total_acquired(),
        }
    }

    /// Reject all current and future waiters. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
        tracing::info!("Concurrency gate closed");
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_capacity_is_enforced() {
        let gate = ConcurrencyGate::new(2);
        let first = gate.try_acquire().unwrap();
        let _second = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_flight(), 2);

        drop(first);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_some());

        let stats = gate.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.peak_in_flight, 2);
        assert_eq!(stats.total_acquired, 3);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        assert_eq!(ConcurrencyGate::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.acquire().await.unwrap();
        gate.close();

        assert!(gate.is_closed());
        assert!(matches!(gate.acquire().await, Err(Error::GateClosed)));
        assert!(gate.try_acquire().is_none());
    }
}
