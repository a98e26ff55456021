//! Scripted in-process engine host and a gated output device.

#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use eci_client::audio::{DeviceError, DoneCallback, OutputDevice};
use eci_client::auth::{self, AuthKey};
use eci_client::protocol::{Message, Payload, commands, events};
use eci_client::transport::Connection;
use eci_client::HostLink;
use parking_lot::Mutex;

/// Audio chunks the host sends after each `synthesize`.
pub const CHUNKS_PER_UTTERANCE: usize = 5;

/// What the scripted host saw.
#[derive(Default)]
pub struct HostLog {
    pub commands: Mutex<Vec<String>>,
}

impl HostLog {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

/// Connect a scripted host to a fresh listener and run the handshake with
/// `host_key` on the host side and `client_key` on the client side.
pub fn connect(client_key: &AuthKey, host_key: AuthKey) -> (eci_client::Result<HostLink>, Arc<HostLog>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(HostLog::default());

    let host_log = Arc::clone(&log);
    thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        let conn = Connection::new(stream).unwrap();
        let (mut reader, mut writer) = conn.split().unwrap();
        if auth::respond(&mut reader, &mut writer, &host_key).is_err() {
            return;
        }
        serve(&conn, reader, writer, &host_log);
    });

    let (stream, _) = listener.accept().unwrap();
    let connection = Connection::new(stream).unwrap();
    let (mut reader, mut writer) = connection.split().unwrap();
    let link = auth::challenge(&mut reader, &mut writer, client_key, Duration::from_secs(2)).map(|()| {
        HostLink {
            connection,
            reader,
            writer,
        }
    });
    (link, log)
}

/// Authenticated link to a well-behaved scripted host.
pub fn scripted_host() -> (HostLink, Arc<HostLog>) {
    let key = AuthKey::generate();
    let (link, log) = connect(&key, key.clone());
    (link.unwrap(), log)
}

fn serve(
    conn: &Connection,
    mut reader: eci_client::transport::FrameReader,
    mut writer: eci_client::transport::FrameWriter,
    log: &HostLog,
) {
    while let Ok(Some(Message::Command { id, command, .. })) = reader.recv() {
        log.commands.lock().push(command.clone());
        match command.as_str() {
            commands::STOP => continue,
            commands::INITIALIZE => {
                let reply = serde_json::json!({
                    "params": {"9": 65536},
                    "voiceParams": {"1": 50, "2": 65, "3": 30, "4": 0, "5": 0, "6": 50, "7": 92},
                });
                let serde_json::Value::Object(reply) = reply else {
                    return;
                };
                if writer.send(&Message::reply(id, reply)).is_err() {
                    return;
                }
            }
            _ => {
                if writer.send(&Message::reply(id, Payload::new())).is_err() {
                    return;
                }
            }
        }

        if command == commands::SYNTHESIZE {
            for _ in 0..CHUNKS_PER_UTTERANCE {
                let mut chunk = Payload::new();
                chunk.insert("data".into(), "AAAAAAAAAAA=".into());
                let _ = writer.send(&Message::event(events::AUDIO, chunk));
            }
            let mut done = Payload::new();
            done.insert("final".into(), true.into());
            let _ = writer.send(&Message::event(events::AUDIO, done));
        }
        if command == commands::DELETE {
            let _ = conn.close();
            return;
        }
    }
}

/// Device whose feeds block until the gate opens or playback is
/// interrupted. Interrupted feeds drop their completion callback.
pub struct GateDevice {
    open: AtomicBool,
    interrupted: AtomicBool,
    played: AtomicUsize,
    entered: Sender<()>,
    pub stops: AtomicUsize,
}

impl GateDevice {
    pub fn new() -> (Arc<Self>, Receiver<()>) {
        let (entered, entered_rx) = unbounded();
        let device = Arc::new(Self {
            open: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            played: AtomicUsize::new(0),
            entered,
            stops: AtomicUsize::new(0),
        });
        (device, entered_rx)
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Feeds that ran to completion.
    pub fn played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

impl OutputDevice for GateDevice {
    fn feed(&self, _pcm: &[u8], on_done: Option<DoneCallback>) -> Result<(), DeviceError> {
        let _ = self.entered.send(());
        while !self.open.load(Ordering::SeqCst) {
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(2));
        }
        self.played.fetch_add(1, Ordering::SeqCst);
        if let Some(done) = on_done {
            done();
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.interrupted.store(false, Ordering::SeqCst);
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

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}
