//! Single-slot admission gate.

use std::sync::atomic::{AtomicBool, Ordering};

/// Non-blocking admission for one outstanding request.
///
/// There is no queue: a caller that loses the race gets `false` and is
/// expected to report busy.
#[derive(Debug, Default)]
pub struct BusyGate {
    held: AtomicBool,
}

impl BusyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        let was_held = self.held.swap(false, Ordering::Release);
        debug_assert!(was_held, "BusyGate released without being acquired");
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}
