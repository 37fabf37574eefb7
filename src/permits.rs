//! Job Permits
//!
//! Caps how many decode/encode jobs run at once, so one large image cannot
//! starve every other request. Permits are released on drop.

use parking_lot::{Condvar, Mutex};

pub struct JobPermits {
    capacity: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

/// RAII guard for one job slot
pub struct JobPermit<'a> {
    permits: &'a JobPermits,
}

impl JobPermits {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    /// Block until a slot frees up.
    pub fn acquire(&self) -> JobPermit<'_> {
        let mut in_use = self.in_use.lock();
        while *in_use >= self.capacity {
            self.released.wait(&mut in_use);
        }
        *in_use += 1;
        JobPermit { permits: self }
    }
}

impl Drop for JobPermit<'_> {
    fn drop(&mut self) {
        let mut in_use = self.permits.in_use.lock();
        *in_use -= 1;
        self.permits.released.notify_one();
    }
}
