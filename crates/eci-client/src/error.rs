//! Client runtime error types.

use std::io;

/// Errors surfaced by the engine client.
///
/// Only the command channel's synchronous calls and host startup return these
/// to a caller. Failures inside the background workers are logged where they
/// happen and never cross a thread boundary.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No response arrived within the reply window.
    #[error("Command {command} timed out")]
    Timeout { command: String },

    /// The engine host answered with an explicit error.
    #[error("Engine host reported an error: {0}")]
    Remote(String),

    /// The connection closed while the request was outstanding.
    #[error("Connection to the engine host closed")]
    TransportClosed,

    /// The receiver loop failed for a reason other than a clean close.
    #[error("Engine host receiver failed: {0}")]
    ReceiverFault(String),

    /// No usable audio output device.
    #[error("Audio output device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A call was made before the host was started.
    #[error("Engine host not started")]
    NotStarted,

    /// Lifecycle call made from a state that does not allow it.
    #[error("Invalid client state: cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    /// The host executable could not be located.
    #[error("Engine host executable missing: {0}")]
    HostMissing(String),

    /// The host process could not be launched or never connected back.
    #[error("Failed to launch engine host: {0}")]
    HostLaunch(String),

    /// The accepted connection did not prove knowledge of the credential.
    #[error("Engine host authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A frame or payload did not match the wire contract.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error on the connection or listener.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether this error means the peer is gone rather than misbehaving.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::TransportClosed | Self::ReceiverFault(_))
    }
}

/// Crate-wide result alias.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Whether an IO error on write means the peer has gone away.
///
/// These are swallowed by the command channel's send path; anything else
/// propagates.
pub(crate) fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}
