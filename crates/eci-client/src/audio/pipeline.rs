//! Audio worker: plays engine audio chunks in order and reports indexes.
//!
//! Chunks arrive from the event dispatcher tagged with the epoch of the batch
//! that produced them. The worker drops stale chunks, plays the rest through
//! the [`OutputDevice`], and turns index markers and end-of-utterance flags
//! into [`IndexMark`] notifications on the session.
//!
//! The dispatcher hands chunks to an unbounded intake so the receiver thread
//! never waits on playback. A forwarding thread moves them into the bounded
//! play queue; that thread is where backpressure lands.
//!
//! Feed, stop and idle are serialized by one re-entrant lock. It is
//! re-entrant because a device may run a completion callback inside `feed`,
//! and that callback performs the idle transition under the same lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace, warn};

use super::device::{DeviceError, DoneCallback, OutputDevice};
use crate::error::{ClientError, Result};
use crate::session::{IndexMark, Session};
use crate::worker::Worker;

/// One unit of engine audio. Empty `data` is a silent marker carrying an
/// index and/or the end-of-utterance flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub index: Option<u32>,
    pub is_final: bool,
    pub epoch: u64,
}

struct Shared {
    device: Arc<dyn OutputDevice>,
    device_lock: ReentrantMutex<()>,
    stopping: AtomicBool,
    session: Arc<Session>,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn handle(self: &Arc<Self>, chunk: AudioChunk) {
        if self.session.epoch.is_stale(chunk.epoch) {
            trace!(epoch = chunk.epoch, "Dropping stale audio chunk");
            return;
        }

        if chunk.data.is_empty() {
            if self.stopping() {
                return;
            }
            if let Some(index) = chunk.index {
                self.session.notify_index(IndexMark::Reached(index));
            }
            if chunk.is_final {
                self.idle_transition();
            }
            return;
        }

        if self.stopping() {
            return;
        }

        let on_done = self.completion(chunk.index, chunk.is_final, chunk.epoch);
        let _device = self.device_lock.lock();
        if self.stopping() {
            return;
        }
        match self.device.feed(&chunk.data, Some(on_done)) {
            Ok(()) => {}
            Err(DeviceError::Unavailable(reason)) => {
                warn!(%reason, "Sound device not found during feed");
            }
            Err(e) => warn!(error = %e, bytes = chunk.data.len(), "Audio feed failed"),
        }
    }

    /// Callback run once the device has played a chunk. It reports nothing
    /// if a stop has superseded the chunk's epoch in the meantime.
    fn completion(
        self: &Arc<Self>,
        index: Option<u32>,
        is_final: bool,
        epoch: u64,
    ) -> DoneCallback {
        let shared = Arc::clone(self);
        Box::new(move || {
            if shared.session.epoch.is_stale(epoch) {
                trace!(epoch, "Completion for a stopped utterance ignored");
                return;
            }
            if let Some(index) = index {
                shared.session.notify_index(IndexMark::Reached(index));
            }
            if is_final {
                shared.idle_transition();
            }
        })
    }

    /// Release the device and announce that the utterance is done.
    fn idle_transition(&self) {
        {
            let _device = self.device_lock.lock();
            if !self.stopping() {
                if let Err(e) = self.device.idle() {
                    warn!(error = %e, "Audio idle failed");
                }
            }
        }
        if !self.stopping() {
            self.session.notify_index(IndexMark::Done);
        }
    }
}

/// Audio intake, bounded play queue and the threads between them.
pub struct AudioPipeline {
    shared: Arc<Shared>,
    intake: Sender<AudioChunk>,
    /// Dropped on shutdown; the disconnect wakes both threads.
    shutdown: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<Worker>>,
    join_timeout: Duration,
}

impl AudioPipeline {
    /// Spawn the forwarding and playback threads. `capacity` bounds the
    /// play queue only.
    pub fn start(
        device: Arc<dyn OutputDevice>,
        session: Arc<Session>,
        capacity: usize,
        join_timeout: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            device,
            device_lock: ReentrantMutex::new(()),
            stopping: AtomicBool::new(false),
            session,
        });
        let (intake, arrivals) = unbounded();
        let (queue, chunks) = bounded(capacity.max(1));
        let (shutdown, shutdown_rx) = bounded::<()>(0);

        let spawn_failed = |e: std::io::Error| {
            ClientError::DeviceUnavailable(format!("failed to spawn audio worker: {e}"))
        };

        let forward_session = Arc::clone(&shared.session);
        let forward_shutdown = shutdown_rx.clone();
        let forwarder = Worker::spawn("eci-audio-intake", move || {
            forward(&forward_session, &arrivals, &queue, &forward_shutdown);
        })
        .map_err(spawn_failed)?;

        let worker_shared = Arc::clone(&shared);
        let player = Worker::spawn("eci-audio", move || {
            run(&worker_shared, &chunks, &shutdown_rx);
        })
        .map_err(spawn_failed)?;

        Ok(Self {
            shared,
            intake,
            shutdown: Mutex::new(Some(shutdown)),
            workers: Mutex::new(vec![forwarder, player]),
            join_timeout,
        })
    }

    /// Producer handle for the event dispatcher. Sends never block.
    pub fn sender(&self) -> Sender<AudioChunk> {
        self.intake.clone()
    }

    /// Queue a chunk without waiting for room in the play queue.
    pub fn enqueue(&self, chunk: AudioChunk) {
        if self.intake.send(chunk).is_err() {
            trace!("Audio worker gone; chunk dropped");
        }
    }

    /// Silence playback now. Everything already handed to the device is
    /// discarded; queued stale chunks are dropped by the worker.
    pub fn silence(&self) {
        self.shared.device.interrupt();
        let _device = self.shared.device_lock.lock();
        if let Err(e) = self.shared.device.stop() {
            warn!(error = %e, "Audio stop failed");
        }
    }

    pub fn pause(&self, paused: bool) {
        let _device = self.shared.device_lock.lock();
        if let Err(e) = self.shared.device.pause(paused) {
            warn!(error = %e, paused, "Audio pause failed");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping()
    }

    /// Stop the worker and close the device. Safe to call more than once.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        self.shared.stopping.store(true, Ordering::SeqCst);
        drop(self.shutdown.lock().take());
        self.shared.device.interrupt();
        for worker in workers {
            worker.join(self.join_timeout);
        }

        let _device = self.shared.device_lock.lock();
        if let Err(e) = self.shared.device.close() {
            warn!(error = %e, "Audio close failed");
        }
        debug!("Audio pipeline shut down");
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Move chunks from the intake into the play queue, dropping stale ones
/// early. Blocks only this thread while the play queue is full.
fn forward(
    session: &Session,
    arrivals: &Receiver<AudioChunk>,
    queue: &Sender<AudioChunk>,
    shutdown: &Receiver<()>,
) {
    loop {
        let chunk = select! {
            recv(shutdown) -> _ => return,
            recv(arrivals) -> chunk => match chunk {
                Ok(chunk) => chunk,
                Err(_) => return,
            },
        };
        if session.epoch.is_stale(chunk.epoch) {
            trace!(epoch = chunk.epoch, "Dropping stale audio chunk");
            continue;
        }
        select! {
            recv(shutdown) -> _ => return,
            send(queue, chunk) -> sent => if sent.is_err() {
                return;
            },
        }
    }
}

fn run(shared: &Arc<Shared>, chunks: &Receiver<AudioChunk>, shutdown: &Receiver<()>) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(chunks) -> chunk => match chunk {
                Ok(chunk) => shared.handle(chunk),
                Err(_) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::audio::device::{DeviceOp, MemoryDevice};

    fn recorder(session: &Session) -> Arc<Mutex<Vec<IndexMark>>> {
        let marks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&marks);
        session.set_index_callback(Some(Arc::new(move |m: IndexMark| sink.lock().push(m))));
        marks
    }

    fn shared(device: Arc<MemoryDevice>) -> (Arc<Shared>, Arc<Session>) {
        let session = Arc::new(Session::new());
        let shared = Arc::new(Shared {
            device,
            device_lock: ReentrantMutex::new(()),
            stopping: AtomicBool::new(false),
            session: Arc::clone(&session),
        });
        (shared, session)
    }

    fn marker(index: Option<u32>, is_final: bool) -> AudioChunk {
        AudioChunk {
            data: Vec::new(),
            index,
            is_final,
            epoch: 0,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn final_marker_idles_once_and_reports_done() {
        let device = Arc::new(MemoryDevice::new());
        let (shared, session) = shared(Arc::clone(&device));
        let marks = recorder(&session);

        shared.handle(marker(Some(7), true));

        assert_eq!(device.count(&DeviceOp::Idle), 1);
        assert_eq!(*marks.lock(), vec![IndexMark::Reached(7), IndexMark::Done]);
    }

    #[test]
    fn markers_are_suppressed_while_stopping() {
        let device = Arc::new(MemoryDevice::new());
        let (shared, session) = shared(Arc::clone(&device));
        let marks = recorder(&session);

        shared.stopping.store(true, Ordering::SeqCst);
        shared.handle(marker(Some(3), true));
        shared.handle(AudioChunk {
            data: vec![0; 64],
            ..marker(None, true)
        });

        assert!(device.ops().is_empty());
        assert!(marks.lock().is_empty());
    }

    #[test]
    fn audio_chunk_reports_index_after_playing() {
        let device = Arc::new(MemoryDevice::new());
        let (shared, session) = shared(Arc::clone(&device));
        let marks = recorder(&session);

        shared.handle(AudioChunk {
            data: vec![1; 32],
            index: Some(12),
            is_final: true,
            epoch: 0,
        });

        assert_eq!(device.ops(), vec![DeviceOp::Feed(32), DeviceOp::Idle]);
        assert_eq!(*marks.lock(), vec![IndexMark::Reached(12), IndexMark::Done]);
        assert_eq!(session.last_index(), Some(12));
    }

    #[test]
    fn stale_chunks_never_reach_the_device() {
        let device = Arc::new(MemoryDevice::new());
        let (shared, session) = shared(Arc::clone(&device));
        let marks = recorder(&session);

        session.epoch.advance();
        shared.handle(AudioChunk {
            data: vec![1; 32],
            index: Some(1),
            is_final: true,
            epoch: 0,
        });
        shared.handle(marker(Some(2), true));

        assert!(device.ops().is_empty());
        assert!(marks.lock().is_empty());
    }

    #[test]
    fn feed_failure_is_not_fatal() {
        let device = Arc::new(MemoryDevice::new());
        let (shared, session) = shared(Arc::clone(&device));
        let marks = recorder(&session);

        device.fail_feeds(true);
        shared.handle(AudioChunk {
            data: vec![1; 8],
            ..marker(Some(1), false)
        });
        device.fail_feeds(false);
        shared.handle(marker(Some(2), true));

        assert_eq!(*marks.lock(), vec![IndexMark::Reached(2), IndexMark::Done]);
    }

    #[test]
    fn completion_after_a_stop_reports_nothing() {
        let device = Arc::new(MemoryDevice::new());
        let (shared, session) = shared(Arc::clone(&device));
        let marks = recorder(&session);

        let on_done = shared.completion(Some(4), true, 0);
        session.epoch.advance();
        on_done();

        assert!(marks.lock().is_empty());
        assert_eq!(device.count(&DeviceOp::Idle), 0);
    }

    /// Feeds block until released; counts what played.
    struct HeldDevice {
        release: Receiver<()>,
        played: Mutex<usize>,
    }

    impl OutputDevice for HeldDevice {
        fn feed(
            &self,
            _pcm: &[u8],
            on_done: Option<DoneCallback>,
        ) -> std::result::Result<(), DeviceError> {
            let _ = self.release.recv_timeout(Duration::from_secs(2));
            *self.played.lock() += 1;
            if let Some(done) = on_done {
                done();
            }
            Ok(())
        }
        fn stop(&self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
        fn idle(&self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
        fn pause(&self, _paused: bool) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
        fn close(&self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn enqueue_never_waits_on_a_full_play_queue() {
        let (release_tx, release) = unbounded();
        let device = Arc::new(HeldDevice {
            release,
            played: Mutex::new(0),
        });
        let session = Arc::new(Session::new());
        let marks = recorder(&session);
        let pipeline = AudioPipeline::start(
            Arc::clone(&device) as Arc<dyn OutputDevice>,
            Arc::clone(&session),
            1,
            Duration::from_secs(1),
        )
        .unwrap();

        let started = Instant::now();
        for i in 0..8 {
            pipeline.enqueue(AudioChunk {
                data: vec![0; 16],
                index: Some(i),
                is_final: i == 7,
                epoch: 0,
            });
        }
        assert!(started.elapsed() < Duration::from_millis(500));

        for _ in 0..8 {
            release_tx.send(()).unwrap();
        }
        wait_until(|| marks.lock().contains(&IndexMark::Done));
        assert_eq!(*device.played.lock(), 8);
    }

    #[test]
    fn worker_plays_in_order_and_shuts_down() {
        let device = Arc::new(MemoryDevice::new());
        let session = Arc::new(Session::new());
        let marks = recorder(&session);
        let pipeline = AudioPipeline::start(
            Arc::clone(&device) as Arc<dyn OutputDevice>,
            Arc::clone(&session),
            4,
            Duration::from_secs(1),
        )
        .unwrap();

        for (i, len) in [(1, 10), (2, 20)] {
            pipeline.enqueue(AudioChunk {
                data: vec![0; len],
                index: Some(i),
                is_final: false,
                epoch: 0,
            });
        }
        pipeline.enqueue(marker(None, true));

        wait_until(|| marks.lock().contains(&IndexMark::Done));
        assert_eq!(
            *marks.lock(),
            vec![IndexMark::Reached(1), IndexMark::Reached(2), IndexMark::Done]
        );

        pipeline.shutdown();
        pipeline.shutdown();
        assert!(pipeline.is_stopping());
        assert_eq!(device.count(&DeviceOp::Close), 1);
    }

    #[test]
    fn silence_interrupts_before_stopping() {
        let device = Arc::new(MemoryDevice::new());
        let session = Arc::new(Session::new());
        let pipeline = AudioPipeline::start(
            Arc::clone(&device) as Arc<dyn OutputDevice>,
            session,
            4,
            Duration::from_secs(1),
        )
        .unwrap();

        pipeline.silence();
        pipeline.pause(true);
        assert_eq!(
            device.ops(),
            vec![DeviceOp::Interrupt, DeviceOp::Stop, DeviceOp::Pause(true)]
        );
    }
}
