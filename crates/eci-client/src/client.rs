//! Engine client: owns the host process, the connection and the workers.
//!
//! Lifecycle:
//!
//! ```text
//! Unstarted ──start──▶ Starting ──ok──▶ Running ──shutdown──▶ ShuttingDown ──▶ Stopped
//!                          │                                                   │
//!                          └────────────────fail──────────────▶ Stopped ◀──────┘
//! Stopped ──start──▶ Starting
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::{AudioPipeline, OutputDevice};
use crate::channel::CommandChannel;
use crate::config::ClientConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::{ClientError, Result};
use crate::host::{HostLink, HostProcess};
use crate::protocol::{Payload, commands, to_payload};
use crate::receiver;
use crate::session::Session;
use crate::transport::Connection;
use crate::worker::Worker;

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl ClientState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Running {
    host: Option<HostProcess>,
    connection: Connection,
    channel: Arc<CommandChannel>,
    receiver: Worker,
    audio: Arc<AudioPipeline>,
}

/// Connection to one engine host.
pub struct EngineClient {
    config: ClientConfig,
    session: Arc<Session>,
    state: Mutex<ClientState>,
    running: RwLock<Option<Running>>,
}

impl EngineClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_session(config, Arc::new(Session::new()))
    }

    pub fn with_session(config: ClientConfig, session: Arc<Session>) -> Self {
        Self {
            config,
            session,
            state: Mutex::new(ClientState::Unstarted),
            running: RwLock::new(None),
        }
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ClientState::Running
    }

    /// Launch the host and start the audio worker and receiver. Returns
    /// immediately if already running.
    pub fn start(&self, device: Arc<dyn OutputDevice>) -> Result<()> {
        self.start_with(device, || {
            let (host, link) = HostProcess::launch(&self.config)?;
            Ok((Some(host), link))
        })
    }

    /// Run over an already authenticated connection with no child process,
    /// e.g. an in-process host.
    pub fn attach(&self, link: HostLink, device: Arc<dyn OutputDevice>) -> Result<()> {
        self.start_with(device, || Ok((None, link)))
    }

    fn start_with(
        &self,
        device: Arc<dyn OutputDevice>,
        connect: impl FnOnce() -> Result<(Option<HostProcess>, HostLink)>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ClientState::Running => return Ok(()),
                ClientState::Unstarted | ClientState::Stopped => *state = ClientState::Starting,
                other => {
                    return Err(ClientError::InvalidState {
                        action: "start",
                        state: other.as_str(),
                    });
                }
            }
        }

        match self.bring_up(device, connect) {
            Ok(running) => {
                *self.running.write() = Some(running);
                *self.state.lock() = ClientState::Running;
                info!("Engine client running");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ClientState::Stopped;
                Err(e)
            }
        }
    }

    fn bring_up(
        &self,
        device: Arc<dyn OutputDevice>,
        connect: impl FnOnce() -> Result<(Option<HostProcess>, HostLink)>,
    ) -> Result<Running> {
        let audio = Arc::new(AudioPipeline::start(
            device,
            Arc::clone(&self.session),
            self.config.audio_queue_capacity,
            self.config.worker_join_timeout,
        )?);

        let (host, link) = match connect() {
            Ok(pair) => pair,
            Err(e) => {
                audio.shutdown();
                return Err(e);
            }
        };
        let HostLink {
            connection,
            reader,
            writer,
        } = link;

        let channel = Arc::new(CommandChannel::new(writer, self.config.reply_timeout));
        let dispatcher = EventDispatcher::new(Arc::clone(&self.session), audio.sender());
        let receiver = match receiver::spawn(reader, Arc::clone(&channel), dispatcher) {
            Ok(worker) => worker,
            Err(e) => {
                audio.shutdown();
                let _ = connection.close();
                if let Some(host) = host {
                    let _ = host.teardown(self.config.terminate_grace);
                }
                return Err(e.into());
            }
        };

        Ok(Running {
            host,
            connection,
            channel,
            receiver,
            audio,
        })
    }

    fn channel(&self) -> Result<Arc<CommandChannel>> {
        self.running
            .read()
            .as_ref()
            .map(|r| Arc::clone(&r.channel))
            .ok_or(ClientError::NotStarted)
    }

    fn audio(&self) -> Option<Arc<AudioPipeline>> {
        self.running.read().as_ref().map(|r| Arc::clone(&r.audio))
    }

    /// Send a command and wait for its reply.
    pub fn call(&self, command: &str, payload: Payload) -> Result<Payload> {
        self.channel()?.call(command, payload)
    }

    /// [`call`](Self::call) with a typed argument struct.
    pub fn invoke<A: Serialize>(&self, command: &str, args: &A) -> Result<Payload> {
        self.call(command, to_payload(args)?)
    }

    /// Send a command without waiting for a reply.
    pub fn notify(&self, command: &str, payload: Payload) -> Result<()> {
        self.channel()?.notify(command, payload)
    }

    /// Cancel everything in flight: advance the epoch, silence local
    /// playback, then tell the engine to stop. Local silence never waits on
    /// the host. No-op when not running.
    pub fn stop(&self) {
        let (channel, audio) = {
            let running = self.running.read();
            let Some(running) = running.as_ref() else {
                return;
            };
            (Arc::clone(&running.channel), Arc::clone(&running.audio))
        };

        let epoch = self.session.epoch.advance();
        audio.silence();
        if let Err(e) = channel.notify(commands::STOP, Payload::new()) {
            debug!(error = %e, "Stop notification failed");
        }
        debug!(epoch, "Speech stopped");
    }

    /// Pause or resume playback.
    pub fn pause(&self, paused: bool) {
        if let Some(audio) = self.audio() {
            audio.pause(paused);
        }
    }

    /// Tear everything down. Each step is best-effort. No-op unless running.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state != ClientState::Running {
                return;
            }
            *state = ClientState::ShuttingDown;
        }
        let Some(running) = self.running.write().take() else {
            *self.state.lock() = ClientState::Stopped;
            return;
        };
        info!("Shutting down engine client");

        running.audio.shutdown();

        if let Err(e) = running.channel.call(commands::DELETE, Payload::new()) {
            warn!(error = %e, "Failed to delete engine cleanly");
        }

        running.receiver.join(self.config.receiver_join_timeout);

        if let Err(e) = running.connection.close() {
            debug!(error = %e, "Closing host connection failed");
        }
        if let Some(host) = running.host {
            let _ = host.teardown(self.config.terminate_grace);
        }

        self.session.set_speaking(false);
        *self.state.lock() = ClientState::Stopped;
        info!("Engine client stopped");
    }
}

impl Drop for EngineClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineClient")
            .field("state", &self.state())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
