use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Caps how many jobs one worker runs at once.
///
/// A slot is held by the executor task for the whole life of a claimed job and
/// released when the [`JobSlot`] is dropped, including on panic or abort.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// An occupied limiter slot.
#[derive(Debug)]
pub struct JobSlot {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot without waiting; `None` when every slot is in use.
    pub fn try_acquire(&self) -> Option<JobSlot> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(JobSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active(&self) -> usize {
        self.capacity - self.available().min(self.capacity)
    }

    pub fn is_saturated(&self) -> bool {
        self.available() == 0
    }
}
