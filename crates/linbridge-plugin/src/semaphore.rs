//! Binary semaphore placed inside a shared-memory region.
//!
//! The count is a single `AtomicU32`, so the same primitive works across
//! threads and across processes that map the same region. `post` never
//! blocks; `wait` spins briefly with [`Backoff`], then sleeps in short
//! slices until it takes the signal or the deadline passes.

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

impl WaitOutcome {
    pub fn is_signaled(self) -> bool {
        self == WaitOutcome::Signaled
    }
}

#[repr(C)]
#[derive(Default)]
pub struct BinarySemaphore {
    count: AtomicU32,
}

impl BinarySemaphore {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Signal the slot. Posting an already signaled slot is a no-op.
    pub fn post(&self) {
        self.count.store(1, Ordering::Release);
    }

    /// Take the signal if present. Only one caller can win a given post.
    pub fn try_take(&self) -> bool {
        self.count
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        if self.try_take() {
            return WaitOutcome::Signaled;
        }

        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if self.try_take() {
                return WaitOutcome::Signaled;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            if backoff.is_completed() {
                std::thread::sleep(SLEEP_SLICE.min(deadline - now));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Drop a pending signal without waiting.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.count.load(Ordering::Acquire) == 1
    }
}
