use std::sync::atomic::{AtomicU64, Ordering};

/// Process-global Lamport clock. Every local mutation stamps a fresh value
/// and every received entry is absorbed through [`Clock::tick`], so that
/// subsequent local versions dominate anything observed so far.
///
/// Lock free: a single atomic cell with a compare-exchange loop.
#[derive(Debug)]
pub struct Clock(AtomicU64);

/// The clock shared by the whole process, mirroring the cluster-wide
/// ordering domain.
pub static DEFAULT: Clock = Clock::new();

impl Clock {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Advances the clock past `observed` and returns the new value:
    /// `max(local, observed) + 1`.
    pub fn tick(&self, observed: u64) -> u64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = current.max(observed) + 1;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
