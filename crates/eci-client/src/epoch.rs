//! Generation counter used as the sole cancellation mechanism.
//!
//! Every stop advances the epoch. Queued work carries the epoch it was
//! created under and is discarded when that value falls behind. The current
//! marker records the epoch of the batch the engine is presently executing so
//! the audio it produces can be tagged accordingly.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared epoch guard.
#[derive(Debug, Default)]
pub struct EpochGuard {
    epoch: AtomicU64,
    current: AtomicU64,
}

impl EpochGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest epoch; new work is tagged with this.
    pub fn get(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Invalidate everything queued so far. Returns the new epoch.
    pub fn advance(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether work tagged `epoch` was superseded by a stop.
    pub fn is_stale(&self, epoch: u64) -> bool {
        epoch < self.get()
    }

    /// Epoch of the batch currently executing on the engine.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Record that a batch tagged `epoch` is now executing.
    pub fn mark_current(&self, epoch: u64) {
        self.current.store(epoch, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_advances_move_the_epoch_by_n() {
        let guard = EpochGuard::new();
        let start = guard.get();
        for _ in 0..7 {
            guard.advance();
        }
        assert_eq!(guard.get(), start + 7);
    }

    #[test]
    fn work_from_before_a_stop_is_stale() {
        let guard = EpochGuard::new();
        let tagged = guard.get();
        assert!(!guard.is_stale(tagged));
        guard.advance();
        assert!(guard.is_stale(tagged));
        assert!(!guard.is_stale(guard.get()));
    }

    #[test]
    fn current_marker_is_independent() {
        let guard = EpochGuard::new();
        guard.advance();
        assert_eq!(guard.current(), 0);
        guard.mark_current(guard.get());
        assert_eq!(guard.current(), 1);
    }
}
