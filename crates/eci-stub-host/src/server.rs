//! One client session: handshake, then commands in, replies and audio out.
//!
//! Replies and events share one writer task so frames never interleave.
//! Rendered utterances go to a streaming task that plays them out in order,
//! optionally paced to real time. A `stop` bumps the generation so anything
//! already queued or half-streamed is abandoned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use eci_client::audio::pcm_duration_ms;
use eci_client::auth::AuthKey;
use eci_client::protocol::{Message, Payload, events, to_payload};
use eci_client::transport::MAX_FRAME_LEN;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::engine::{Outcome, StubEngine, Utterance};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// PCM per audio event.
    pub chunk_ms: u32,
    /// Stream audio in real time instead of as fast as possible.
    pub paced: bool,
}

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

async fn send(transport: &mut Transport, message: &Message) -> anyhow::Result<()> {
    let body = serde_json::to_vec(message)?;
    transport.send(Bytes::from(body)).await?;
    Ok(())
}

async fn recv(transport: &mut Transport) -> anyhow::Result<Option<Message>> {
    match transport.next().await {
        Some(frame) => Ok(Some(serde_json::from_slice(&frame?)?)),
        None => Ok(None),
    }
}

/// Answer the client's challenge and wait to be welcomed.
async fn handshake(transport: &mut Transport, key: &AuthKey) -> anyhow::Result<()> {
    let nonce = match recv(transport).await? {
        Some(Message::Challenge { nonce }) => nonce,
        Some(other) => bail!("expected challenge, got {}", other.kind()),
        None => bail!("client closed before the handshake"),
    };
    let nonce = hex::decode(nonce).context("malformed nonce")?;
    let digest = key.digest(&nonce)?;
    send(
        transport,
        &Message::Answer {
            digest: hex::encode(digest),
        },
    )
    .await?;

    match recv(transport).await? {
        Some(Message::Welcome) => Ok(()),
        _ => bail!("client rejected the handshake"),
    }
}

/// Serve one connected client until it deletes the engine or disconnects.
pub async fn serve(stream: TcpStream, key: &AuthKey, options: ServeOptions) -> anyhow::Result<()> {
    let mut transport = Framed::new(stream, codec());
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut transport, key))
        .await
        .context("handshake timed out")??;
    info!("Client authenticated");

    let (mut sink, mut frames) = transport.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let body = serde_json::to_vec(&message)?;
            sink.send(Bytes::from(body)).await?;
        }
        sink.close().await?;
        anyhow::Ok(())
    });

    let generation = Arc::new(AtomicU64::new(0));
    let (speech_tx, speech_rx) = mpsc::unbounded_channel::<(u64, Utterance)>();
    let streamer = tokio::spawn(stream_audio(
        speech_rx,
        out_tx.clone(),
        Arc::clone(&generation),
        options.paced,
    ));

    let mut engine = StubEngine::new(options.chunk_ms);
    while let Some(frame) = frames.next().await {
        let frame = frame.context("reading frame")?;
        let message: Message = match serde_json::from_slice(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping malformed frame");
                continue;
            }
        };
        let (id, command, payload) = match message {
            Message::Command {
                id,
                command,
                payload,
            } => (id, command, payload),
            other => {
                warn!(kind = other.kind(), "Ignoring non-command frame");
                continue;
            }
        };
        debug!(id, %command, "Command received");

        match engine.handle(&command, payload) {
            Outcome::Reply(payload) => out_tx.send(Message::reply(id, payload)).await?,
            Outcome::Failed(error) => {
                warn!(id, %command, %error, "Command failed");
                out_tx.send(Message::reply_error(id, error)).await?;
            }
            Outcome::Speak(utterance) => {
                out_tx.send(Message::reply(id, Payload::new())).await?;
                let _ = speech_tx.send((generation.load(Ordering::SeqCst), utterance));
            }
            Outcome::Stop => {
                generation.fetch_add(1, Ordering::SeqCst);
                out_tx
                    .send(Message::event(events::STOPPED, Payload::new()))
                    .await?;
            }
            Outcome::Exit => {
                out_tx.send(Message::reply(id, Payload::new())).await?;
                info!("Engine deleted; closing session");
                break;
            }
        }
    }

    generation.fetch_add(1, Ordering::SeqCst);
    drop(speech_tx);
    drop(out_tx);
    let _ = streamer.await;
    writer.await??;
    Ok(())
}

async fn stream_audio(
    mut utterances: mpsc::UnboundedReceiver<(u64, Utterance)>,
    out: mpsc::Sender<Message>,
    generation: Arc<AtomicU64>,
    paced: bool,
) {
    while let Some((born, utterance)) = utterances.recv().await {
        for frame in utterance.frames {
            if generation.load(Ordering::SeqCst) != born {
                debug!(born, "Utterance abandoned");
                break;
            }
            let pace = Duration::from_millis(pcm_duration_ms(frame.data.len()));
            let payload = match to_payload(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to encode audio frame");
                    continue;
                }
            };
            if out.send(Message::event(events::AUDIO, payload)).await.is_err() {
                return;
            }
            if paced && !pace.is_zero() {
                tokio::time::sleep(pace).await;
            }
        }
    }
}
