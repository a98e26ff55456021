//! Request/response command channel.
//!
//! Callers are serialized only for the send phase: allocating an id,
//! registering the pending entry and writing the frame happen under one lock;
//! waiting for the reply happens outside it. Replies are routed back by the
//! receiver thread through [`CommandChannel::complete`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, trace};

use crate::error::{ClientError, Result, is_peer_gone};
use crate::protocol::{Message, Payload, to_payload};
use crate::transport::FrameWriter;

type Reply = Result<Payload>;

#[derive(Default)]
struct PendingState {
    entries: HashMap<u64, Sender<Reply>>,
    closed: bool,
}

/// Outstanding requests keyed by id, plus the connection-closed latch.
#[derive(Default)]
struct PendingTable {
    state: Mutex<PendingState>,
}

impl PendingTable {
    /// Register `id`. Fails once the connection has been observed closed.
    fn register(&self, id: u64, tx: Sender<Reply>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.entries.insert(id, tx);
        true
    }

    fn remove(&self, id: u64) -> Option<Sender<Reply>> {
        self.state.lock().entries.remove(&id)
    }
}

struct Writer {
    next_id: u64,
    frames: FrameWriter,
}

/// Mutually exclusive command sender over the host connection.
pub struct CommandChannel {
    writer: Mutex<Writer>,
    pending: Arc<PendingTable>,
    reply_timeout: Duration,
}

impl CommandChannel {
    pub fn new(frames: FrameWriter, reply_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(Writer { next_id: 1, frames }),
            pending: Arc::new(PendingTable::default()),
            reply_timeout,
        }
    }

    /// Send `command` and block for its reply for at most the configured
    /// reply timeout.
    pub fn call(&self, command: &str, payload: Payload) -> Result<Payload> {
        self.begin(command, payload)?.wait(self.reply_timeout)
    }

    /// [`call`](Self::call) with a typed argument struct.
    pub fn invoke<A: Serialize>(&self, command: &str, args: &A) -> Result<Payload> {
        self.call(command, to_payload(args)?)
    }

    /// Send `command` and register for its reply without waiting.
    ///
    /// A peer that has already gone away yields a reply that resolves
    /// immediately to an empty payload.
    pub fn begin(&self, command: &str, payload: Payload) -> Result<PendingReply> {
        let mut writer = self.writer.lock();
        let id = writer.next_id;
        writer.next_id += 1;

        let (tx, rx) = bounded(1);
        if !self.pending.register(id, tx) {
            debug!(command, "Connection closed; command dropped");
            return Ok(PendingReply::ready(id, command, Ok(Payload::new())));
        }

        match writer.frames.send(&Message::command(id, command, payload)) {
            Ok(()) => {
                trace!(id, command, "Command sent");
                Ok(PendingReply {
                    id,
                    command: command.to_string(),
                    rx,
                    table: Some(Arc::clone(&self.pending)),
                })
            }
            Err(ClientError::Io(e)) if is_peer_gone(&e) => {
                self.pending.remove(id);
                debug!(command, error = %e, "Peer gone while sending");
                Ok(PendingReply::ready(id, command, Ok(Payload::new())))
            }
            Err(e) => {
                self.pending.remove(id);
                Err(e)
            }
        }
    }

    /// Fire a command without registering for a reply.
    pub fn notify(&self, command: &str, payload: Payload) -> Result<()> {
        let mut writer = self.writer.lock();
        if self.is_closed() {
            return Ok(());
        }
        let id = writer.next_id;
        writer.next_id += 1;

        match writer.frames.send(&Message::command(id, command, payload)) {
            Ok(()) => Ok(()),
            Err(ClientError::Io(e)) if is_peer_gone(&e) => {
                debug!(command, error = %e, "Peer gone while sending");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve the pending entry for `id`. Returns `false` when nobody was
    /// waiting for it.
    pub fn complete(&self, id: u64, reply: Reply) -> bool {
        match self.pending.remove(id) {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Latch the channel closed and fail every outstanding request with the
    /// error built by `make`. Returns how many were failed.
    pub fn fail_all(&self, make: impl Fn() -> ClientError) -> usize {
        let drained: Vec<_> = {
            let mut state = self.pending.state.lock();
            state.closed = true;
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make()));
        }
        count
    }

    /// Whether the receiver has observed the connection closing.
    pub fn is_closed(&self) -> bool {
        self.pending.state.lock().closed
    }

    /// Number of requests awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.pending.state.lock().entries.len()
    }

    pub const fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
}

/// Handle on one outstanding request. Dropping it unregisters the request.
pub struct PendingReply {
    id: u64,
    command: String,
    rx: Receiver<Reply>,
    table: Option<Arc<PendingTable>>,
}

impl PendingReply {
    fn ready(id: u64, command: &str, reply: Reply) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(reply);
        Self {
            id,
            command: command.to_string(),
            rx,
            table: None,
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Block until the reply arrives or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> Result<Payload> {
        let started = Instant::now();
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    command = %self.command,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Command timed out"
                );
                Err(ClientError::Timeout {
                    command: self.command.clone(),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::TransportClosed),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            table.remove(self.id);
        }
    }
}
