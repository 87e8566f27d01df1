//! Single-shot gate
//!
//! A compare-and-set flag that lets exactly one caller through, no matter how
//! many tasks race on it. Used for continuation reuse, tunnel teardown and
//! error replies.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct OnceGate {
    fired: AtomicBool,
}

impl OnceGate {
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Returns `true` for the first caller only.
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
