//! Length-prefixed JSON framing over the loopback connection.
//!
//! Wire format: `[4 bytes: body len u32 BE] [N bytes: JSON message]`.
//! The host side reads the same layout with a length-delimited codec, so
//! both ends agree without sharing code.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::protocol::Message;

/// Upper bound on a single frame body. Audio chunks are far smaller; anything
/// above this means the stream is out of sync.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Owner of the duplex stream. Hands out a reader/writer pair that share the
/// socket, and closes both halves on [`Connection::close`].
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Wrap an accepted or connected stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Split into independent read and write halves.
    pub fn split(&self) -> io::Result<(FrameReader, FrameWriter)> {
        let reader = FrameReader::new(self.stream.try_clone()?);
        let writer = FrameWriter::new(self.stream.try_clone()?);
        Ok((reader, writer))
    }

    /// Shut down both directions. Any thread blocked in a read observes EOF.
    pub fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            // Already closed by the peer.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// Peer address, for logging.
    pub fn peer(&self) -> String {
        self.stream
            .peer_addr()
            .map_or_else(|_| "<unknown>".to_string(), |a| a.to_string())
    }
}

// ── Reader ─────────────────────────────────────────────────────────

/// Blocking frame reader.
#[derive(Debug)]
pub struct FrameReader {
    inner: BufReader<TcpStream>,
}

impl FrameReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Bound how long [`recv`](Self::recv) may block. `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.get_ref().set_read_timeout(timeout)
    }

    /// Read one raw frame body. `Ok(None)` means the peer closed cleanly on a
    /// frame boundary.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ClientError::Protocol(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
            )));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body)?;
        Ok(Some(body))
    }

    /// Read and decode one message.
    ///
    /// A body that is not a valid message yields [`ClientError::Json`]; the
    /// stream is still aligned on the next frame in that case.
    pub fn recv(&mut self) -> Result<Option<Message>> {
        match self.read_frame()? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

// ── Writer ─────────────────────────────────────────────────────────

/// Blocking frame writer.
#[derive(Debug)]
pub struct FrameWriter {
    stream: TcpStream,
}

impl FrameWriter {
    fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Encode and write one message as a single frame.
    ///
    /// Encoding failures surface as [`ClientError::Json`] /
    /// [`ClientError::Protocol`]; socket failures as [`ClientError::Io`].
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(ClientError::Protocol(format!(
                "{} frame of {} bytes exceeds limit",
                message.kind(),
                body.len()
            )));
        }
        let len = u32::try_from(body.len())
            .map_err(|_| ClientError::Protocol("frame length overflow".into()))?;

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;

    use crate::protocol::{Payload, events};

    /// Connected loopback pair: (client side, peer side).
    pub(crate) fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Connection::new(client).unwrap(), Connection::new(server).unwrap())
    }

    /// Write bytes straight to the socket, bypassing framing.
    pub(crate) fn write_raw(conn: &Connection, bytes: &[u8]) {
        let mut raw = conn.stream.try_clone().unwrap();
        raw.write_all(bytes).unwrap();
    }

    #[test]
    fn frames_survive_the_socket() {
        let (a, b) = pair();
        let (_, mut writer) = a.split().unwrap();
        let (mut reader, _) = b.split().unwrap();

        writer.send(&Message::event(events::STOPPED, Payload::new())).unwrap();
        writer.send(&Message::reply(4, Payload::new())).unwrap();

        assert_eq!(
            reader.recv().unwrap(),
            Some(Message::event(events::STOPPED, Payload::new()))
        );
        assert_eq!(reader.recv().unwrap(), Some(Message::reply(4, Payload::new())));
    }

    #[test]
    fn clean_close_reads_as_none() {
        let (a, b) = pair();
        let (mut reader, _) = b.split().unwrap();
        a.close().unwrap();
        drop(a);
        assert!(reader.recv().unwrap().is_none());
    }

    #[test]
    fn garbage_body_is_a_json_error_and_stream_stays_aligned() {
        let (a, b) = pair();
        let (mut reader, _) = b.split().unwrap();
        let (_, mut writer) = a.split().unwrap();

        let mut raw = a.stream.try_clone().unwrap();
        raw.write_all(&3u32.to_be_bytes()).unwrap();
        raw.write_all(b"{{{").unwrap();
        writer.send(&Message::Welcome).unwrap();

        assert!(matches!(reader.recv(), Err(ClientError::Json(_))));
        assert_eq!(reader.recv().unwrap(), Some(Message::Welcome));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let (a, b) = pair();
        let (mut reader, _) = b.split().unwrap();
        let mut raw = a.stream.try_clone().unwrap();
        raw.write_all(&u32::MAX.to_be_bytes()).unwrap();
        assert!(matches!(reader.recv(), Err(ClientError::Protocol(_))));
    }
}
