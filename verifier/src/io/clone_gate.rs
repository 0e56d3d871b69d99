//! System-wide cap on concurrent repository clones.
//!
//! Only the clone step is gated; checkouts of an existing clone are not.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::debug;

#[derive(Debug)]
pub struct CloneGate {
    capacity: usize,
    available: Mutex<usize>,
    cv: Condvar,
}

impl CloneGate {
    /// A gate admitting `capacity` clones at once (at least one).
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            available: Mutex::new(capacity),
            cv: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - *self.lock_or_recover()
    }

    /// Block until a clone permit is free.
    pub fn acquire(self: &Arc<Self>) -> ClonePermit {
        let mut available = self.lock_or_recover();
        while *available == 0 {
            available = match self.cv.wait(available) {
                Ok(guard) => guard,
                Err(poison) => poison.into_inner(),
            };
        }
        *available -= 1;
        debug!(remaining = *available, "clone permit acquired");
        ClonePermit {
            gate: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut available = self.lock_or_recover();
        *available = (*available + 1).min(self.capacity);
        drop(available);
        self.cv.notify_one();
    }

    /// Permits must be returned even if a clone worker panicked.
    fn lock_or_recover(&self) -> MutexGuard<'_, usize> {
        match self.available.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}

/// Releases its clone slot on drop.
#[derive(Debug)]
pub struct ClonePermit {
    gate: Arc<CloneGate>,
}

impl Drop for ClonePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
