//! Launch credential and connection handshake.
//!
//! The client generates a random key, passes it to the host on the command
//! line, and after accepting the host's connection issues a nonce. The host
//! must answer with `HMAC-SHA256(key, nonce)` before any command is sent.
//! Another local process that merely races to connect to the listening port
//! cannot produce the digest.

use std::fmt;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::protocol::Message;
use crate::transport::{FrameReader, FrameWriter};

type HmacSha256 = Hmac<Sha256>;

/// Size of the launch credential in bytes.
pub const AUTH_KEY_BYTES: usize = 16;

/// Size of the handshake nonce in bytes.
pub const NONCE_BYTES: usize = 32;

/// Shared secret handed to the host at launch.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey([u8; AUTH_KEY_BYTES]);

impl AuthKey {
    /// Fresh random key from the thread RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; AUTH_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse the hex form passed on the command line.
    pub fn from_hex(text: &str) -> Result<Self> {
        let raw = hex::decode(text.trim())
            .map_err(|e| ClientError::AuthenticationFailed(format!("malformed key: {e}")))?;
        let bytes: [u8; AUTH_KEY_BYTES] = raw.try_into().map_err(|_| {
            ClientError::AuthenticationFailed(format!("key must be {AUTH_KEY_BYTES} bytes"))
        })?;
        Ok(Self(bytes))
    }

    /// Hex form for the command line.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Keyed digest of `nonce`.
    pub fn digest(&self, nonce: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(nonce);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time check of a peer's digest.
    pub fn verify(&self, nonce: &[u8], digest: &[u8]) -> bool {
        self.mac().is_ok_and(|mut mac| {
            mac.update(nonce);
            mac.verify_slice(digest).is_ok()
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.0)
            .map_err(|e| ClientError::AuthenticationFailed(e.to_string()))
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(<redacted>)")
    }
}

/// Client side of the handshake. Fails unless the peer answers the nonce
/// correctly within `timeout`.
pub fn challenge(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    key: &AuthKey,
    timeout: Duration,
) -> Result<()> {
    let mut nonce = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut nonce);

    writer.send(&Message::Challenge {
        nonce: hex::encode(nonce),
    })?;

    reader.set_read_timeout(Some(timeout))?;
    let answer = reader.recv();
    reader.set_read_timeout(None)?;

    let digest = match answer {
        Ok(Some(Message::Answer { digest })) => digest,
        Ok(Some(other)) => {
            return Err(ClientError::AuthenticationFailed(format!(
                "expected answer, got {}",
                other.kind()
            )));
        }
        Ok(None) => {
            return Err(ClientError::AuthenticationFailed(
                "peer closed during handshake".into(),
            ));
        }
        Err(e) => return Err(ClientError::AuthenticationFailed(e.to_string())),
    };

    let digest = hex::decode(digest)
        .map_err(|e| ClientError::AuthenticationFailed(format!("malformed digest: {e}")))?;
    if !key.verify(&nonce, &digest) {
        return Err(ClientError::AuthenticationFailed("digest mismatch".into()));
    }

    writer.send(&Message::Welcome)?;
    debug!("Engine host authenticated");
    Ok(())
}

/// Host side of the handshake, for blocking peers.
pub fn respond(reader: &mut FrameReader, writer: &mut FrameWriter, key: &AuthKey) -> Result<()> {
    let nonce = match reader.recv()? {
        Some(Message::Challenge { nonce }) => nonce,
        other => {
            return Err(ClientError::AuthenticationFailed(format!(
                "expected challenge, got {}",
                other.as_ref().map_or("eof", Message::kind)
            )));
        }
    };
    let nonce = hex::decode(nonce)
        .map_err(|e| ClientError::AuthenticationFailed(format!("malformed nonce: {e}")))?;
    writer.send(&Message::Answer {
        digest: hex::encode(key.digest(&nonce)?),
    })?;

    match reader.recv()? {
        Some(Message::Welcome) => Ok(()),
        _ => Err(ClientError::AuthenticationFailed("not welcomed".into())),
    }
}
