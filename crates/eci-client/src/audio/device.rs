//! `OutputDevice` abstraction for engine audio playback.
//!
//! | Implementor | Where used |
//! |---|---|
//! | `RodioDevice` (feature `playback`) | Real playback on the default output device |
//! | [`NullDevice`] | No device available; audio is dropped, callbacks still fire |
//! | [`MemoryDevice`] | Headless runs and tests; records every call |
//!
//! All methods take `&self` so the device can sit behind the pipeline's
//! re-entrant lock; implementations use interior mutability.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Engine output sample rate.
pub const SAMPLE_RATE: u32 = 11_025;
/// Engine output channel count.
pub const CHANNELS: u16 = 1;
/// Engine output sample width.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Fired once the fed audio has finished playing.
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// Errors raised by an output device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// No output device could be opened.
    #[error("No audio output device: {0}")]
    Unavailable(String),

    /// The device rejected an operation.
    #[error("Audio output stream error: {0}")]
    Stream(String),

    /// The dedicated audio thread exited.
    #[error("Audio thread is no longer running")]
    ThreadDied,
}

impl From<DeviceError> for crate::error::ClientError {
    fn from(err: DeviceError) -> Self {
        Self::DeviceUnavailable(err.to_string())
    }
}

/// Playback sink for 11025 Hz mono 16-bit little-endian PCM.
pub trait OutputDevice: Send + Sync {
    /// Queue `pcm` for playback. May block for buffer space. `on_done` fires
    /// when the audio has played; it is dropped unfired if playback is
    /// stopped first.
    fn feed(&self, pcm: &[u8], on_done: Option<DoneCallback>) -> Result<(), DeviceError>;

    /// Discard everything queued and fall silent.
    fn stop(&self) -> Result<(), DeviceError>;

    /// No more audio is coming for now; flush and release the hardware.
    fn idle(&self) -> Result<(), DeviceError>;

    fn pause(&self, paused: bool) -> Result<(), DeviceError>;

    /// Release the device for good.
    fn close(&self) -> Result<(), DeviceError>;

    /// Wake a [`feed`](Self::feed) blocked on buffer space. Called without
    /// holding the pipeline's device lock, so it must not block.
    fn interrupt(&self) {}
}

// ── NullDevice ─────────────────────────────────────────────────────

/// Stand-in when no output device could be opened.
#[derive(Debug, Default)]
pub struct NullDevice;

impl OutputDevice for NullDevice {
    fn feed(&self, _pcm: &[u8], on_done: Option<DoneCallback>) -> Result<(), DeviceError> {
        if let Some(done) = on_done {
            done();
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn idle(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn pause(&self, _paused: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

// ── MemoryDevice ───────────────────────────────────────────────────

/// One call observed by a [`MemoryDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    Feed(usize),
    Stop,
    Idle,
    Pause(bool),
    Close,
    Interrupt,
}

/// Device that keeps fed PCM in memory and "plays" it instantly.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    pcm: Mutex<Vec<u8>>,
    ops: Mutex<Vec<DeviceOp>>,
    fail_feeds: AtomicBool,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent feed fail with [`DeviceError::Stream`].
    pub fn fail_feeds(&self, fail: bool) {
        self.fail_feeds.store(fail, Ordering::SeqCst);
    }

    /// PCM fed so far.
    pub fn pcm(&self) -> Vec<u8> {
        self.pcm.lock().clone()
    }

    /// Calls observed so far, in order.
    pub fn ops(&self) -> Vec<DeviceOp> {
        self.ops.lock().clone()
    }

    pub fn count(&self, op: &DeviceOp) -> usize {
        self.ops.lock().iter().filter(|o| *o == op).count()
    }

    /// Number of feeds, whatever their size.
    pub fn feeds(&self) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|o| matches!(o, DeviceOp::Feed(_)))
            .count()
    }

    fn record(&self, op: DeviceOp) {
        self.ops.lock().push(op);
    }
}

impl OutputDevice for MemoryDevice {
    fn feed(&self, pcm: &[u8], on_done: Option<DoneCallback>) -> Result<(), DeviceError> {
        if self.fail_feeds.load(Ordering::SeqCst) {
            return Err(DeviceError::Stream("feed rejected".into()));
        }
        self.record(DeviceOp::Feed(pcm.len()));
        self.pcm.lock().extend_from_slice(pcm);
        if let Some(done) = on_done {
            done();
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.record(DeviceOp::Stop);
        Ok(())
    }

    fn idle(&self) -> Result<(), DeviceError> {
        self.record(DeviceOp::Idle);
        Ok(())
    }

    fn pause(&self, paused: bool) -> Result<(), DeviceError> {
        self.record(DeviceOp::Pause(paused));
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        self.record(DeviceOp::Close);
        Ok(())
    }

    fn interrupt(&self) {
        self.record(DeviceOp::Interrupt);
    }
}

/// Convert little-endian 16-bit PCM bytes to samples. A trailing odd byte is
/// dropped.
pub fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Playback duration of `bytes` of engine PCM, in milliseconds.
pub fn pcm_duration_ms(bytes: usize) -> u64 {
    let frame = u64::from(CHANNELS) * u64::from(BITS_PER_SAMPLE / 8);
    (bytes as u64 / frame) * 1000 / u64::from(SAMPLE_RATE)
}
