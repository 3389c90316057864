//! Bounded admission for sandbox executions.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    serde::Serialize,
    tokio::sync::{OwnedSemaphorePermit, Semaphore},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{
    deadline::{Deadline, StopReason},
    error::{Error, Result},
};

/// Point-in-time utilization of an [`AdmissionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub capacity: usize,
    pub active: usize,
    pub available: usize,
    pub processed: u64,
}

#[derive(Debug)]
struct Counters {
    active: AtomicUsize,
    processed: AtomicU64,
}

impl Counters {
    fn on_grant(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn on_release(&self) {
        // A release with nothing held is ignored entirely.
        if self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Counting semaphore that bounds concurrently running sandboxes.
///
/// Slots are not handed out in request order; a waiter is either granted a
/// slot or times out.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    capacity: usize,
    acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl AdmissionController {
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            acquire_timeout,
            permits: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(Counters {
                active: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a slot for at most the configured acquire timeout.
    ///
    /// Returns [`Error::AdmissionExhausted`] on timeout and
    /// [`Error::Cancelled`] when `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<AdmissionSlot> {
        let deadline = Deadline::after(self.acquire_timeout, cancel);
        tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                // The semaphore is never closed, so an error here is unreachable
                // in practice; report it as backpressure rather than panicking.
                let permit = permit.map_err(|_| self.exhausted())?;
                Ok(self.grant(permit))
            },
            reason = deadline.expired() => match reason {
                StopReason::Timeout => {
                    warn!(
                        capacity = self.capacity,
                        timeout_ms = self.acquire_timeout.as_millis() as u64,
                        "admission wait timed out"
                    );
                    Err(self.exhausted())
                },
                StopReason::Cancelled => Err(Error::Cancelled),
            },
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        Some(self.grant(permit))
    }

    /// Return a slot. Equivalent to dropping it.
    pub fn release(&self, slot: AdmissionSlot) {
        drop(slot);
    }

    pub fn stats(&self) -> AdmissionStats {
        let active = self.counters.active.load(Ordering::SeqCst).min(self.capacity);
        AdmissionStats {
            capacity: self.capacity,
            active,
            available: self.capacity - active,
            processed: self.counters.processed.load(Ordering::SeqCst),
        }
    }

    pub fn is_full(&self) -> bool {
        self.permits.available_permits() == 0
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> AdmissionSlot {
        self.counters.on_grant();
        debug!(
            active = self.counters.active.load(Ordering::SeqCst),
            capacity = self.capacity,
            "admission slot granted"
        );
        #[cfg(feature = "metrics")]
        counter!("sandjob_admission_granted_total").increment(1);
        AdmissionSlot {
            permit: Some(permit),
            counters: Arc::clone(&self.counters),
        }
    }

    fn exhausted(&self) -> Error {
        #[cfg(feature = "metrics")]
        counter!("sandjob_admission_rejected_total").increment(1);
        Error::AdmissionExhausted {
            capacity: self.capacity,
        }
    }
}

/// Proof that one unit of admission capacity is held.
///
/// The slot is returned exactly once, when it is dropped or handed to
/// [`AdmissionController::release`].
#[derive(Debug)]
#[must_use = "dropping the slot releases it immediately"]
pub struct AdmissionSlot {
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            // Decrement before the permit goes back so `active` never exceeds
            // the number of outstanding permits.
            self.counters.on_release();
            drop(permit);
        }
    }
}
