//! State shared between the caller, the receiver and both workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use crate::epoch::EpochGuard;
use crate::params::ParamTable;

/// What an index callback is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMark {
    /// Playback reached an inserted index.
    Reached(u32),
    /// The utterance finished playing.
    Done,
}

/// Receives index and completion notifications from the audio worker.
pub type IndexCallback = Arc<dyn Fn(IndexMark) + Send + Sync>;

const NO_INDEX: i64 = -1;

/// Epoch, parameter mirrors and playback flags.
pub struct Session {
    pub epoch: EpochGuard,
    /// Engine parameters (`setParam`).
    pub params: ParamTable,
    /// Base voice parameters (`setVoiceParam` with `temporary == false`).
    pub voice_params: ParamTable,
    speaking: AtomicBool,
    last_index: AtomicI64,
    on_index: RwLock<Option<IndexCallback>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            epoch: EpochGuard::new(),
            params: ParamTable::new(),
            voice_params: ParamTable::new(),
            speaking: AtomicBool::new(false),
            last_index: AtomicI64::new(NO_INDEX),
            on_index: RwLock::new(None),
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::SeqCst);
    }

    /// Most recent index reached during playback.
    pub fn last_index(&self) -> Option<u32> {
        u32::try_from(self.last_index.load(Ordering::SeqCst)).ok()
    }

    pub fn set_index_callback(&self, callback: Option<IndexCallback>) {
        *self.on_index.write() = callback;
    }

    /// Record `mark` and forward it to the callback. A panicking callback is
    /// logged and contained.
    pub fn notify_index(&self, mark: IndexMark) {
        if let IndexMark::Reached(value) = mark {
            self.last_index.store(i64::from(value), Ordering::SeqCst);
        }
        let callback = self.on_index.read().clone();
        if let Some(callback) = callback {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(mark)));
            if result.is_err() {
                warn!(?mark, "Index callback panicked");
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("epoch", &self.epoch)
            .field("speaking", &self.is_speaking())
            .field("last_index", &self.last_index())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn reached_updates_last_index_and_done_does_not() {
        let session = Session::new();
        assert_eq!(session.last_index(), None);
        session.notify_index(IndexMark::Reached(4));
        session.notify_index(IndexMark::Done);
        assert_eq!(session.last_index(), Some(4));
    }

    #[test]
    fn callback_sees_marks_in_order() {
        let session = Session::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.set_index_callback(Some(Arc::new(move |m: IndexMark| sink.lock().push(m))));

        session.notify_index(IndexMark::Reached(1));
        session.notify_index(IndexMark::Done);
        assert_eq!(*seen.lock(), vec![IndexMark::Reached(1), IndexMark::Done]);
    }

    #[test]
    fn panicking_callback_is_contained() {
        let session = Session::new();
        session.set_index_callback(Some(Arc::new(|_| panic!("boom"))));
        session.notify_index(IndexMark::Reached(2));
        assert_eq!(session.last_index(), Some(2));
    }
}
