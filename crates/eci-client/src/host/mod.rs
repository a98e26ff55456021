//! Engine host process: launch, connect-back, authentication and teardown.
//!
//! The client listens on an ephemeral loopback port and launches the host
//! with the address and a one-time credential. The host connects back; the
//! first connection must pass the [`auth`](crate::auth) handshake or startup
//! fails. Host stderr is forwarded to `tracing` line by line.

mod shutdown;

pub use shutdown::shutdown_child;

use std::io::{self, BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::auth::{self, AuthKey};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transport::{Connection, FrameReader, FrameWriter};

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// A launched host child and the listener it connected to.
#[derive(Debug)]
pub struct HostProcess {
    child: Child,
    listener: Option<TcpListener>,
    address: SocketAddr,
}

/// An authenticated connection split for the receiver and the command
/// channel. `connection` closes both halves.
#[derive(Debug)]
pub struct HostLink {
    pub connection: Connection,
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

impl HostProcess {
    /// Launch the host and wait for it to connect back and authenticate.
    pub fn launch(config: &ClientConfig) -> Result<(Self, HostLink)> {
        let host = config.resolve_host()?;
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let address = listener.local_addr()?;
        let key = AuthKey::generate();

        info!(
            program = %host.program().display(),
            source = ?host.source,
            %address,
            "Launching engine host"
        );
        let mut child = Command::new(&host.program)
            .args(&host.args)
            .arg("--address")
            .arg(address.to_string())
            .arg("--authkey")
            .arg(key.to_hex())
            .arg("--log-dir")
            .arg(&config.log_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    ClientError::HostMissing(format!("{}: {e}", host.program.display()))
                }
                _ => ClientError::HostLaunch(format!("{}: {e}", host.program.display())),
            })?;
        debug!(pid = child.id(), "Engine host spawned");

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, child.id());
        }

        match connect(&listener, &mut child, &key, config.connect_timeout) {
            Ok(link) => {
                info!(pid = child.id(), peer = %link.connection.peer(), "Engine host connected");
                Ok((
                    Self {
                        child,
                        listener: Some(listener),
                        address,
                    },
                    link,
                ))
            }
            Err(e) => {
                if let Err(kill_err) = shutdown_child(&mut child, Duration::ZERO) {
                    warn!(error = %kill_err, "Failed to reap engine host after failed start");
                }
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Address the client listened on.
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether the child has exited, without blocking.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Close the listener, then stop the child. The listener is released
    /// even if termination fails.
    pub fn teardown(mut self, grace: Duration) -> io::Result<ExitStatus> {
        drop(self.listener.take());
        let status = shutdown_child(&mut self.child, grace);
        match &status {
            Ok(status) => info!(%status, "Engine host exited"),
            Err(e) => warn!(error = %e, "Failed to terminate engine host"),
        }
        status
    }
}

/// Accept one connection within `timeout` and authenticate it. Gives up
/// early if the child exits first.
fn connect(
    listener: &TcpListener,
    child: &mut Child,
    key: &AuthKey,
    timeout: Duration,
) -> Result<HostLink> {
    let deadline = Instant::now() + timeout;
    let stream = accept_until(listener, child, deadline)?;

    let connection = Connection::new(stream)?;
    let (mut reader, mut writer) = connection.split()?;
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(100));
    auth::challenge(&mut reader, &mut writer, key, remaining)?;
    Ok(HostLink {
        connection,
        reader,
        writer,
    })
}

fn accept_until(listener: &TcpListener, child: &mut Child, deadline: Instant) -> Result<TcpStream> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "Accepted host connection");
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(status) = child.try_wait()? {
            return Err(ClientError::HostLaunch(format!(
                "host exited with {status} before connecting"
            )));
        }
        if Instant::now() >= deadline {
            return Err(ClientError::HostLaunch(
                "host did not connect before the timeout".into(),
            ));
        }
        thread::sleep(ACCEPT_POLL);
    }
}

fn forward_stderr(stderr: ChildStderr, pid: u32) {
    let spawned = thread::Builder::new()
        .name("eci-host-log".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => {
                        debug!(target: "eci_host", pid, "{line}");
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            debug!(pid, "Host log reader exiting");
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start host log reader");
    }
}
