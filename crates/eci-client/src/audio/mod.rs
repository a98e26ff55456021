//! Audio output: device abstraction and the playback pipeline.

mod device;
mod pipeline;
#[cfg(feature = "playback")]
mod rodio_device;

pub use device::{
    BITS_PER_SAMPLE, CHANNELS, DeviceError, DeviceOp, DoneCallback, MemoryDevice, NullDevice,
    OutputDevice, SAMPLE_RATE, pcm_duration_ms, pcm_to_samples,
};
pub use pipeline::{AudioChunk, AudioPipeline};
#[cfg(feature = "playback")]
pub use rodio_device::RodioDevice;

use std::sync::Arc;

use tracing::warn;

/// Open the default output device, falling back to [`NullDevice`] when
/// there is none. A missing device is not an error: speech is skipped.
#[cfg(feature = "playback")]
pub fn open_default(buffer_ms: u32) -> Arc<dyn OutputDevice> {
    match RodioDevice::open(buffer_ms) {
        Ok(device) => Arc::new(device),
        Err(e) => {
            warn!(error = %e, "No audio output device; speech will be silent");
            Arc::new(NullDevice)
        }
    }
}

/// Open the default output device. Built without the `playback` feature,
/// this is always [`NullDevice`].
#[cfg(not(feature = "playback"))]
pub fn open_default(buffer_ms: u32) -> Arc<dyn OutputDevice> {
    warn!(buffer_ms, "Built without audio playback; speech will be silent");
    Arc::new(NullDevice)
}
