//! Admission Control
//!
//! A capacity-bounded gate over concurrently active streaming sessions.
//!
//! # Design
//!
//! Slots are tokio semaphore permits. A successful [`AdmissionController::acquire`]
//! yields an [`AdmissionPermit`]; the slot is returned exactly once, either by
//! [`AdmissionPermit::release`] or when the permit is dropped (including on
//! panic unwinding). A timed-out acquire yields no permit, so there is nothing
//! to release.
//!
//! Controllers are constructed explicitly and shared via `Arc`; there is no
//! process-global instance, so tests can build independent controllers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Errors from admission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// No slot freed before the timeout
    #[error("Server is overloaded: no streaming slot available within {0:?}")]
    Timeout(Duration),
    /// The controller was closed
    #[error("Admission controller is closed")]
    Closed,
}

/// Snapshot of admission statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Configured capacity
    pub capacity: usize,
    /// Slots currently free
    pub available: usize,
    /// Successful acquires
    pub acquired: u64,
    /// Slots returned
    pub released: u64,
    /// Acquires that timed out
    pub timed_out: u64,
    /// Sessions currently waiting for a slot
    pub waiting: usize,
    /// Total time spent waiting (ms)
    pub total_wait_time_ms: u64,
}

/// Atomic counters for lock-free updates
#[derive(Default)]
struct StatsAtomic {
    acquired: AtomicU64,
    released: AtomicU64,
    timed_out: AtomicU64,
    waiting: AtomicUsize,
    total_wait_time_ms: AtomicU64,
}

/// Bounds the number of concurrently active sessions
pub struct AdmissionController {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<StatsAtomic>,
}

impl AdmissionController {
    /// Create a controller with a fixed capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            stats: Arc::new(StatsAtomic::default()),
        }
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot, up to `timeout`
    pub async fn acquire(&self, timeout: Duration) -> Result<AdmissionPermit, AdmissionError> {
        self.stats.waiting.fetch_add(1, Ordering::Relaxed);
        let wait_start = Instant::now();

        let result =
            tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await;

        self.stats.waiting.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .total_wait_time_ms
            .fetch_add(wait_start.elapsed().as_millis() as u64, Ordering::Relaxed);

        match result {
            Ok(Ok(permit)) => {
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    available = self.semaphore.available_permits(),
                    capacity = self.capacity,
                    "Admission slot acquired"
                );
                Ok(AdmissionPermit {
                    permit: Some(permit),
                    stats: Arc::clone(&self.stats),
                })
            }
            Ok(Err(_)) => Err(AdmissionError::Closed),
            Err(_) => {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    capacity = self.capacity,
                    "Admission timed out"
                );
                Err(AdmissionError::Timeout(timeout))
            }
        }
    }

    /// Take a slot only if one is free right now
    #[must_use]
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Some(AdmissionPermit {
            permit: Some(permit),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Stop admitting; pending and future acquires fail with `Closed`
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            capacity: self.capacity,
            available: self.semaphore.available_permits(),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            waiting: self.stats.waiting.load(Ordering::Relaxed),
            total_wait_time_ms: self.stats.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A held admission slot (RAII guard)
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    stats: Arc<StatsAtomic>,
}

impl AdmissionPermit {
    /// Return the slot
    pub fn release(mut self) {
        self.return_slot();
    }

    fn return_slot(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.stats.released.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Admission slot released");
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.return_slot();
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("held", &self.permit.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let controller = AdmissionController::new(2);
        let permit = controller.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(controller.available(), 1);

        permit.release();
        let stats = controller.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
    }

    #[tokio::test]
    async fn test_timeout_at_capacity() {
        let controller = AdmissionController::new(1);
        let _held = controller.acquire(Duration::from_millis(50)).await.unwrap();

        let result = controller.acquire(Duration::from_millis(20)).await;
        assert_eq!(result.unwrap_err(), AdmissionError::Timeout(Duration::from_millis(20)));

        let stats = controller.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_waiter_admitted_when_slot_frees() {
        let controller = Arc::new(AdmissionController::new(1));
        let held = controller.acquire(Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire(Duration::from_secs(2)).await.is_ok() })
        };

        tokio::task::yield_now().await;
        drop(held);

        assert!(waiter.await.unwrap());
        assert_eq!(controller.stats().released, 2);
    }

    #[test]
    fn test_drop_releases_exactly_once() {
        let controller = AdmissionController::new(1);
        let permit = controller.try_acquire().unwrap();
        assert!(controller.try_acquire().is_none());

        drop(permit);
        assert_eq!(controller.available(), 1);
        assert_eq!(controller.stats().released, 1);
    }

    #[tokio::test]
    async fn test_closed_controller() {
        let controller = AdmissionController::new(1);
        controller.close();
        let result = controller.acquire(Duration::from_millis(10)).await;
        assert_eq!(result.unwrap_err(), AdmissionError::Closed);
    }
}
