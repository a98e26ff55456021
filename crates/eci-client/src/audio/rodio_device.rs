//! `rodio` output confined to a dedicated thread.
//!
//! `rodio::OutputStream` is `!Send` on some platforms, so the stream and its
//! sink live on one OS thread and every operation is proxied through a
//! command channel. [`RodioDevice`] is the `Send + Sync` handle.
//!
//! Completion callbacks are queued by the mixer and run on a separate
//! callback thread, so a callback that takes the pipeline's device lock can
//! never stall audio output.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::{Condvar, Mutex};
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, info, warn};

use super::device::{
    CHANNELS, DeviceError, DoneCallback, OutputDevice, SAMPLE_RATE, pcm_duration_ms,
    pcm_to_samples,
};

// ── Commands ───────────────────────────────────────────────────────

enum OutputCommand {
    Append {
        samples: Vec<i16>,
        duration_ms: u64,
        on_done: Option<DoneCallback>,
        reply: Sender<Result<(), DeviceError>>,
    },
    Stop { reply: Sender<()> },
    Idle,
    Pause(bool),
    Shutdown,
}

/// Milliseconds of audio handed to the sink but not yet played.
#[derive(Default)]
struct Backlog {
    queued_ms: Mutex<u64>,
    drained: Condvar,
    interrupted: AtomicBool,
}

impl Backlog {
    fn add(&self, ms: u64) {
        *self.queued_ms.lock() += ms;
    }

    fn played(&self, ms: u64) {
        let mut queued = self.queued_ms.lock();
        *queued = queued.saturating_sub(ms);
        self.drained.notify_all();
    }

    fn reset(&self) {
        *self.queued_ms.lock() = 0;
        self.drained.notify_all();
    }

    /// Block until the backlog is under `limit_ms`. Returns `false` if
    /// interrupted first.
    fn wait_below(&self, limit_ms: u64) -> bool {
        let mut queued = self.queued_ms.lock();
        while *queued > limit_ms {
            if self.interrupted.load(Ordering::SeqCst) {
                return false;
            }
            self.drained
                .wait_for(&mut queued, Duration::from_millis(50));
        }
        !self.interrupted.load(Ordering::SeqCst)
    }
}

// ── Handle ─────────────────────────────────────────────────────────

/// Playback on the default output device.
pub struct RodioDevice {
    cmd_tx: Sender<OutputCommand>,
    backlog: Arc<Backlog>,
    buffer_ms: u64,
    closed: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl RodioDevice {
    /// Open the default output device. `buffer_ms` bounds how much audio may
    /// be queued ahead of playback before [`feed`](OutputDevice::feed) blocks.
    pub fn open(buffer_ms: u32) -> Result<Self, DeviceError> {
        let (cmd_tx, cmd_rx) = unbounded::<OutputCommand>();
        let (init_tx, init_rx) = bounded::<Result<(), DeviceError>>(1);
        let (done_tx, done_rx) = unbounded::<DoneCallback>();
        let backlog = Arc::new(Backlog::default());

        let actor_backlog = Arc::clone(&backlog);
        let actor = thread::Builder::new()
            .name("eci-output".into())
            .spawn(move || run(&cmd_rx, &init_tx, &done_tx, &actor_backlog))
            .map_err(|e| DeviceError::Stream(format!("failed to spawn audio thread: {e}")))?;

        init_rx.recv().map_err(|_| DeviceError::ThreadDied)??;

        let callbacks = thread::Builder::new()
            .name("eci-output-callbacks".into())
            .spawn(move || {
                while let Ok(done) = done_rx.recv() {
                    done();
                }
            })
            .map_err(|e| DeviceError::Stream(format!("failed to spawn callback thread: {e}")))?;

        Ok(Self {
            cmd_tx,
            backlog,
            buffer_ms: u64::from(buffer_ms),
            closed: AtomicBool::new(false),
            threads: Mutex::new(vec![actor, callbacks]),
        })
    }

    fn send(&self, cmd: OutputCommand) -> Result<(), DeviceError> {
        self.cmd_tx.send(cmd).map_err(|_| DeviceError::ThreadDied)
    }
}

impl OutputDevice for RodioDevice {
    fn feed(&self, pcm: &[u8], on_done: Option<DoneCallback>) -> Result<(), DeviceError> {
        if !self.backlog.wait_below(self.buffer_ms) {
            debug!("Feed interrupted");
            return Ok(());
        }
        let (reply, reply_rx) = bounded(1);
        self.send(OutputCommand::Append {
            samples: pcm_to_samples(pcm),
            duration_ms: pcm_duration_ms(pcm.len()),
            on_done,
            reply,
        })?;
        reply_rx.recv().map_err(|_| DeviceError::ThreadDied)?
    }

    fn stop(&self) -> Result<(), DeviceError> {
        let (reply, reply_rx) = bounded(1);
        self.send(OutputCommand::Stop { reply })?;
        reply_rx.recv().map_err(|_| DeviceError::ThreadDied)?;
        self.backlog.interrupted.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn idle(&self) -> Result<(), DeviceError> {
        self.send(OutputCommand::Idle)
    }

    fn pause(&self, paused: bool) -> Result<(), DeviceError> {
        self.send(OutputCommand::Pause(paused))
    }

    fn close(&self) -> Result<(), DeviceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.interrupt();
        let _ = self.cmd_tx.send(OutputCommand::Shutdown);
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("Audio output thread panicked");
            }
        }
        Ok(())
    }

    fn interrupt(&self) {
        self.backlog.interrupted.store(true, Ordering::SeqCst);
        self.backlog.drained.notify_all();
    }
}

impl Drop for RodioDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ── Audio thread ───────────────────────────────────────────────────

struct Output {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Option<Sink>,
}

impl Output {
    fn sink(&mut self) -> Result<&Sink, DeviceError> {
        if self.sink.is_none() {
            let sink =
                Sink::try_new(&self.handle).map_err(|e| DeviceError::Stream(e.to_string()))?;
            self.sink = Some(sink);
        }
        self.sink
            .as_ref()
            .ok_or_else(|| DeviceError::Stream("sink unavailable".into()))
    }
}

fn run(
    cmd_rx: &Receiver<OutputCommand>,
    init_tx: &Sender<Result<(), DeviceError>>,
    done_tx: &Sender<DoneCallback>,
    backlog: &Arc<Backlog>,
) {
    let (stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = init_tx.send(Err(DeviceError::Unavailable(e.to_string())));
            return;
        }
    };
    info!(sample_rate = SAMPLE_RATE, "Audio output opened on default device");
    if init_tx.send(Ok(())).is_err() {
        return;
    }

    let mut output = Output {
        _stream: stream,
        handle,
        sink: None,
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            OutputCommand::Append {
                samples,
                duration_ms,
                on_done,
                reply,
            } => {
                let result = output.sink().map(|sink| {
                    backlog.add(duration_ms);
                    sink.append(SamplesBuffer::new(CHANNELS, SAMPLE_RATE, samples));

                    let played = Arc::clone(backlog);
                    let done_tx = done_tx.clone();
                    let on_done = Mutex::new(on_done);
                    sink.append(EmptyCallback::<i16>::new(Box::new(move || {
                        played.played(duration_ms);
                        if let Some(done) = on_done.lock().take() {
                            let _ = done_tx.send(done);
                        }
                    })));
                });
                let _ = reply.send(result);
            }
            OutputCommand::Stop { reply } => {
                // A stopped sink drops its queued sources and their callbacks;
                // the next append starts a fresh one.
                if let Some(sink) = output.sink.take() {
                    sink.stop();
                }
                backlog.reset();
                let _ = reply.send(());
            }
            OutputCommand::Idle => {
                if output.sink.as_ref().is_some_and(Sink::empty) {
                    output.sink = None;
                }
            }
            OutputCommand::Pause(paused) => {
                if let Some(sink) = &output.sink {
                    if paused {
                        sink.pause();
                    } else {
                        sink.play();
                    }
                }
            }
            OutputCommand::Shutdown => break,
        }
    }

    if let Some(sink) = output.sink.take() {
        sink.stop();
    }
    debug!("Audio output thread exiting");
}
