//! Admission control for operations.
//!
//! The gate bounds how many operations of a job execute at once. Waiters are
//! served strictly in arrival order; the semaphore hands a released slot to the
//! longest waiter before anyone else can take it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Default number of simultaneously running operations
pub const DEFAULT_CAPACITY: usize = 4;

/// Default for OCR and security workloads
pub const HEAVY_CAPACITY: usize = 2;

/// Why a slot could not be taken
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// The gate stopped admitting, e.g. because its job was cancelled
    #[error("Concurrency gate is closed")]
    Closed,

    /// Every slot is held
    #[error("No free slot in concurrency gate")]
    NoFreeSlot,
}

/// Counting, FIFO-fair admission gate
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    holders: Arc<AtomicUsize>,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `capacity` holders (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            holders: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot.
    ///
    /// Fails with [`GateError::Closed`] if the gate is closed before or while waiting.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;
        Ok(self.hold(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Result<GatePermit, GateError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.hold(permit)),
            Err(TryAcquireError::Closed) => Err(GateError::Closed),
            Err(TryAcquireError::NoPermits) => Err(GateError::NoFreeSlot),
        }
    }

    fn hold(&self, permit: OwnedSemaphorePermit) -> GatePermit {
        let held = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(held <= self.capacity, "gate admitted {held} holders, capacity {}", self.capacity);
        debug!(holders = held, capacity = self.capacity, "Acquired gate slot");
        GatePermit {
            permit: Some(permit),
            holders: self.holders.clone(),
        }
    }

    /// Stop admitting. Current waiters and later callers get [`GateError::Closed`];
    /// existing holders keep their slots until they release them.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Whether `other` is a handle to this same gate
    pub fn same_gate(&self, other: &ConcurrencyGate) -> bool {
        Arc::ptr_eq(&self.semaphore, &other.semaphore)
    }

    /// Whether [`ConcurrencyGate::close`] was called
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Maximum number of simultaneous holders
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held slot. Dropping it releases the slot, so every exit path returns it.
#[derive(Debug)]
pub struct GatePermit {
    permit: Option<OwnedSemaphorePermit>,
    holders: Arc<AtomicUsize>,
}

impl GatePermit {
    /// Release the slot explicitly. Consumes the permit, so it can only happen once.
    pub fn release(mut self) {
        self.return_slot();
    }

    fn return_slot(&mut self) {
        if let Some(permit) = self.permit.take() {
            // Decrement before the semaphore wakes the next waiter.
            let previous = self.holders.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(previous > 0, "gate slot released more often than acquired");
            drop(permit);
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.return_slot();
    }
}
