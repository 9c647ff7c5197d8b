//! Engine-wide "storage disabled" switch.
//!
//! Tripping the switch makes every engine that shares it reject new requests
//! with [`BlockError::NoSuchDevice`](crate::BlockError::NoSuchDevice) and drain
//! its queues after the next batch completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag that disables storage for every engine holding a clone.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    tripped: Arc<AtomicBool>,
}

impl FaultSwitch {
    /// Creates a switch in the healthy state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables storage.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }

    /// Re-enables storage.
    pub fn reset(&self) {
        self.tripped.store(false, Ordering::SeqCst);
    }

    /// Returns `true` while storage is disabled.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}
