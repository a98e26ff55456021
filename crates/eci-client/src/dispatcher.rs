//! Routes host-pushed events to the audio queue and session state.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

use crate::audio::AudioChunk;
use crate::protocol::{AudioEvent, Payload, events, from_payload};
use crate::session::Session;

/// Classifies `event` frames from the host.
pub struct EventDispatcher {
    session: Arc<Session>,
    audio: Sender<AudioChunk>,
}

impl EventDispatcher {
    pub const fn new(session: Arc<Session>, audio: Sender<AudioChunk>) -> Self {
        Self { session, audio }
    }

    /// Handle one event. Audio is tagged with the epoch of the batch the
    /// engine is currently executing. Never blocks: the audio intake is
    /// unbounded, so replies behind audio frames are always read promptly.
    pub fn dispatch(&self, event: &str, payload: Payload) {
        match event {
            events::AUDIO => match from_payload::<AudioEvent>(payload) {
                Ok(audio) => {
                    let chunk = AudioChunk {
                        data: audio.data,
                        index: audio.index,
                        is_final: audio.is_final,
                        epoch: self.session.epoch.current(),
                    };
                    if self.audio.send(chunk).is_err() {
                        trace!("Audio worker gone; chunk dropped");
                    }
                }
                Err(e) => warn!(error = %e, "Malformed audio event dropped"),
            },
            events::STOPPED => {
                debug!("Host reported stopped");
                self.session.set_speaking(false);
            }
            other => debug!(event = other, "Unhandled host event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use serde_json::{Value, json};

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    #[test]
    fn audio_is_tagged_with_the_current_batch_epoch() {
        let session = Arc::new(Session::new());
        let (tx, rx) = unbounded();
        let dispatcher = EventDispatcher::new(Arc::clone(&session), tx);

        session.epoch.advance();
        session.epoch.advance();
        session.epoch.mark_current(1);
        dispatcher.dispatch(
            events::AUDIO,
            payload(json!({"data": "AAAA", "index": 5, "final": true})),
        );

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.epoch, 1);
        assert_eq!(chunk.data, vec![0, 0, 0]);
        assert_eq!(chunk.index, Some(5));
        assert!(chunk.is_final);
    }

    #[test]
    fn stopped_only_clears_speaking() {
        let session = Arc::new(Session::new());
        let (tx, rx) = unbounded();
        let dispatcher = EventDispatcher::new(Arc::clone(&session), tx);

        session.set_speaking(true);
        dispatcher.dispatch(events::STOPPED, Payload::new());

        assert!(!session.is_speaking());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_and_unknown_events_are_dropped() {
        let session = Arc::new(Session::new());
        let (tx, rx) = unbounded();
        let dispatcher = EventDispatcher::new(session, tx);

        dispatcher.dispatch(events::AUDIO, payload(json!({"data": "not base64!"})));
        dispatcher.dispatch("progress", Payload::new());

        assert!(rx.try_recv().is_err());
    }
}
