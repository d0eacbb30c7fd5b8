use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter.
///
/// All operations return the value after the update.
#[derive(Debug, Default)]
pub struct Counter {
    total: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u64) -> u64 {
        self.total.store(value, Ordering::Release);
        value
    }

    /// Saturates at `u64::MAX`.
    pub fn add(&self, summand: u64) -> u64 {
        let mut current = self.total.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(summand);
            match self.total.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn increment(&self) -> u64 {
        self.add(1)
    }

    pub fn reset(&self) -> u64 {
        self.set(0)
    }
}
