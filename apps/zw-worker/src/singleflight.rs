use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-flight guard for one periodic job type. A trigger that finds
/// the previous run of the same type still active is dropped, never
/// queued or parallelized.
#[derive(Clone, Default)]
pub struct RunGuard {
    in_flight: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag. `None` means a run is already in flight.
    pub fn try_begin(&self) -> Option<RunToken> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunToken {
                in_flight: Arc::clone(&self.in_flight),
            })
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Clears the in-flight flag when dropped, so a panicking run cannot
/// wedge the scheduler.
pub struct RunToken {
    in_flight: Arc<AtomicBool>,
}

impl Drop for RunToken {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}
