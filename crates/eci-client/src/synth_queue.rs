//! Synthesis queue: executes speak batches one at a time, in order.
//!
//! Each batch carries the epoch it was built under. A batch that a stop has
//! since superseded is dropped whole without touching the engine. Otherwise
//! the worker marks the batch's epoch as current (so the audio it produces
//! is tagged correctly) and runs every operation; a failing operation is
//! logged and the rest still run.
//!
//! The worker starts lazily on the first submit and can be stopped and
//! started again; batches queued while it is stopped wait for the next start.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::params::VoiceParam;
use crate::session::Session;
use crate::worker::Worker;

/// One engine operation inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthOp {
    /// Append already-encoded text.
    AddText(Vec<u8>),
    InsertIndex(u32),
    Synthesize,
    /// Temporary `base * multiplier + offset` against the live base value.
    Prosody {
        param: VoiceParam,
        multiplier: f64,
        offset: i32,
    },
    /// Switch the active voice, keeping the base voice parameters.
    SetVoice(i32),
}

/// Ordered operations from one speak request.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBatch {
    pub ops: Vec<SynthOp>,
    pub epoch: u64,
}

/// Runs a single [`SynthOp`] against the engine.
pub trait BatchExecutor: Send + Sync {
    fn execute(&self, op: &SynthOp) -> Result<()>;
}

struct Running {
    shutdown: Sender<()>,
    worker: Worker,
}

/// FIFO of [`CommandBatch`]es plus the worker that drains it.
pub struct SynthQueue {
    executor: Arc<dyn BatchExecutor>,
    session: Arc<Session>,
    queue: Sender<CommandBatch>,
    batches: Receiver<CommandBatch>,
    running: Mutex<Option<Running>>,
    join_timeout: Duration,
}

impl SynthQueue {
    pub fn new(
        executor: Arc<dyn BatchExecutor>,
        session: Arc<Session>,
        join_timeout: Duration,
    ) -> Self {
        let (queue, batches) = unbounded();
        Self {
            executor,
            session,
            queue,
            batches,
            running: Mutex::new(None),
            join_timeout,
        }
    }

    /// Queue `batch` and make sure the worker is running.
    pub fn submit(&self, batch: CommandBatch) -> Result<()> {
        self.queue
            .send(batch)
            .map_err(|_| ClientError::Protocol("synthesis queue closed".into()))?;
        self.ensure_started()
    }

    /// Start the worker unless it is already running. Idempotent.
    pub fn ensure_started(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.worker.is_finished()) {
            return Ok(());
        }

        let (shutdown, shutdown_rx) = bounded(1);
        let executor = Arc::clone(&self.executor);
        let session = Arc::clone(&self.session);
        let batches = self.batches.clone();
        let worker = Worker::spawn("eci-synth", move || {
            run(executor.as_ref(), &session, &batches, &shutdown_rx);
        })?;
        *running = Some(Running { shutdown, worker });
        Ok(())
    }

    /// Stop the worker, waiting up to the join timeout. Idempotent.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.shutdown.try_send(());
        running.worker.join(self.join_timeout);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.worker.is_finished())
    }

    /// Batches waiting to be executed.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl Drop for SynthQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    executor: &dyn BatchExecutor,
    session: &Session,
    batches: &Receiver<CommandBatch>,
    shutdown: &Receiver<()>,
) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(batches) -> batch => match batch {
                Ok(batch) => execute(executor, session, batch),
                Err(_) => break,
            },
        }
    }
}

fn execute(executor: &dyn BatchExecutor, session: &Session, batch: CommandBatch) {
    if session.epoch.is_stale(batch.epoch) {
        debug!(
            epoch = batch.epoch,
            ops = batch.ops.len(),
            "Discarding stale synthesis batch"
        );
        return;
    }

    session.epoch.mark_current(batch.epoch);
    session.set_speaking(true);
    for op in &batch.ops {
        if let Err(e) = executor.execute(op) {
            warn!(?op, error = %e, "Synthesis command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        ops: Mutex<Vec<SynthOp>>,
        fail_index: Option<u32>,
    }

    impl BatchExecutor for Recorder {
        fn execute(&self, op: &SynthOp) -> Result<()> {
            self.ops.lock().push(op.clone());
            match op {
                SynthOp::InsertIndex(i) if Some(*i) == self.fail_index => {
                    Err(ClientError::Remote("rejected".into()))
                }
                _ => Ok(()),
            }
        }
    }

    fn queue(recorder: &Arc<Recorder>) -> (SynthQueue, Arc<Session>) {
        let session = Arc::new(Session::new());
        let queue = SynthQueue::new(
            Arc::clone(recorder) as Arc<dyn BatchExecutor>,
            Arc::clone(&session),
            Duration::from_secs(1),
        );
        (queue, session)
    }

    fn wait_for(recorder: &Recorder, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while recorder.ops.lock().len() < count {
            assert!(Instant::now() < deadline, "ops never executed");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn utterance(epoch: u64) -> CommandBatch {
        CommandBatch {
            ops: vec![
                SynthOp::AddText(b"hello".to_vec()),
                SynthOp::InsertIndex(1),
                SynthOp::Synthesize,
            ],
            epoch,
        }
    }

    #[test]
    fn failing_op_does_not_abort_the_batch() {
        let recorder = Arc::new(Recorder {
            fail_index: Some(1),
            ..Recorder::default()
        });
        let (queue, session) = queue(&recorder);

        queue.submit(utterance(0)).unwrap();
        wait_for(&recorder, 3);

        assert_eq!(recorder.ops.lock().len(), 3);
        assert_eq!(recorder.ops.lock()[2], SynthOp::Synthesize);
        assert!(session.is_speaking());
    }

    #[test]
    fn batch_stopped_before_consumption_never_reaches_the_engine() {
        let recorder = Arc::new(Recorder::default());
        let (queue, session) = queue(&recorder);

        let batch = utterance(session.epoch.get());
        session.epoch.advance();
        queue.submit(batch).unwrap();
        queue.submit(CommandBatch {
            ops: vec![SynthOp::InsertIndex(9)],
            epoch: session.epoch.get(),
        })
        .unwrap();

        wait_for(&recorder, 1);
        assert_eq!(*recorder.ops.lock(), vec![SynthOp::InsertIndex(9)]);
        assert_eq!(session.epoch.current(), 1);
    }

    #[test]
    fn batches_run_in_submission_order() {
        let recorder = Arc::new(Recorder::default());
        let (queue, _session) = queue(&recorder);

        for i in 0..5 {
            queue.submit(CommandBatch {
                ops: vec![SynthOp::InsertIndex(i)],
                epoch: 0,
            })
            .unwrap();
        }
        wait_for(&recorder, 5);
        let seen: Vec<_> = recorder.ops.lock().clone();
        assert_eq!(seen, (0..5).map(SynthOp::InsertIndex).collect::<Vec<_>>());
    }

    #[test]
    fn start_and_stop_are_idempotent_and_restartable() {
        let recorder = Arc::new(Recorder::default());
        let (queue, _session) = queue(&recorder);

        queue.ensure_started().unwrap();
        queue.ensure_started().unwrap();
        assert!(queue.is_running());
        queue.stop();
        queue.stop();
        assert!(!queue.is_running());

        queue.submit(utterance(0)).unwrap();
        assert!(queue.is_running());
        wait_for(&recorder, 3);
    }
}
