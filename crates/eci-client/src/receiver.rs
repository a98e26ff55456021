//! Event receiver: the single reader of the host connection.
//!
//! Responses go to the command channel's pending table, events to the
//! dispatcher. When the connection ends, every outstanding request is failed
//! and the loop exits.

use std::io;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::channel::CommandChannel;
use crate::dispatcher::EventDispatcher;
use crate::error::ClientError;
use crate::protocol::Message;
use crate::transport::FrameReader;
use crate::worker::Worker;

pub(crate) fn spawn(
    reader: FrameReader,
    channel: Arc<CommandChannel>,
    dispatcher: EventDispatcher,
) -> io::Result<Worker> {
    Worker::spawn("eci-receiver", move || run(reader, &channel, &dispatcher))
}

fn run(mut reader: FrameReader, channel: &CommandChannel, dispatcher: &EventDispatcher) {
    loop {
        match reader.recv() {
            Ok(Some(message)) => route(message, channel, dispatcher),
            Ok(None) => {
                info!("Host connection closed");
                fail_pending(channel, || ClientError::TransportClosed);
                break;
            }
            Err(ClientError::Json(e)) => {
                warn!(error = %e, "Skipping malformed frame");
            }
            Err(ClientError::Io(e)) => {
                info!(error = %e, "Host connection lost");
                fail_pending(channel, || ClientError::TransportClosed);
                break;
            }
            Err(e) => {
                error!(error = %e, "Unexpected error in receiver loop");
                let reason = e.to_string();
                fail_pending(channel, || ClientError::ReceiverFault(reason.clone()));
                break;
            }
        }
    }
}

fn route(message: Message, channel: &CommandChannel, dispatcher: &EventDispatcher) {
    match message {
        Message::Response { id, payload, error } => {
            let reply = match error {
                Some(error) => Err(ClientError::Remote(error)),
                None => Ok(payload.unwrap_or_default()),
            };
            if !channel.complete(id, reply) {
                trace!(id, "Response without a waiter dropped");
            }
        }
        Message::Event { event, payload } => dispatcher.dispatch(&event, payload),
        other => warn!(kind = other.kind(), "Unknown message type from host"),
    }
}

fn fail_pending(channel: &CommandChannel, make: impl Fn() -> ClientError) {
    let failed = channel.fail_all(make);
    if failed > 0 {
        debug!(failed, "Failed outstanding requests");
    }
}
