// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command socket: the management interface of each daemon.
//!
//! One UNIX `SOCK_STREAM` socket per daemon; one request/confirm exchange
//! per accepted connection. Both directions are length-prefixed (u32,
//! network order) byte blocks whose first two bytes carry the service
//! type; the remaining bytes are serialized with the same big-endian area
//! codec used on the air. The daemon answers and closes.
//!
//! The listener runs non-blocking and is polled by the management thread
//! so the daemon exit flag is observed within the poll interval.

use crate::wire::area::{AssemblyArea, DisassemblyArea};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for a single command-socket message.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Command socket error.
#[derive(Debug)]
pub enum CmdSockError {
    Io(io::Error),
    /// Peer announced a message beyond [`MAX_MESSAGE_SIZE`].
    MessageTooLarge(usize),
    /// Peer closed the stream mid-message.
    Truncated,
}

impl fmt::Display for CmdSockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "command socket i/o error: {e}"),
            Self::MessageTooLarge(n) => write!(f, "command socket message of {n} bytes refused"),
            Self::Truncated => write!(f, "command socket stream closed mid-message"),
        }
    }
}

impl std::error::Error for CmdSockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CmdSockError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for command socket operations.
pub type Result<T> = std::result::Result<T, CmdSockError>;

fn write_message(stream: &mut UnixStream, bytes: &[u8]) -> Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()?;
    Ok(())
}

fn read_message(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    read_exact(stream, &mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CmdSockError::MessageTooLarge(len));
    }
    let mut bytes = vec![0u8; len];
    read_exact(stream, &mut bytes)?;
    Ok(bytes)
}

fn read_exact(stream: &mut UnixStream, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CmdSockError::Truncated),
        Err(e) => Err(e.into()),
    }
}

/// Daemon-side listener.
pub struct CommandServer {
    listener: UnixListener,
    path: PathBuf,
    exchange_timeout: Duration,
}

impl CommandServer {
    /// Bind the socket, replacing a stale socket file from a previous run.
    pub fn bind(path: &Path, exchange_timeout: Duration) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            exchange_timeout,
        })
    }

    /// Accept and fully read one request, if a client is waiting.
    ///
    /// Returns `None` when nobody connected; the management thread sleeps
    /// briefly and re-polls so it can watch the exit flag in between.
    pub fn poll_request(&self) -> Result<Option<Exchange>> {
        match self.listener.accept() {
            Ok((mut stream, _addr)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(self.exchange_timeout))?;
                stream.set_write_timeout(Some(self.exchange_timeout))?;
                let request = read_message(&mut stream)?;
                Ok(Some(Exchange { stream, request }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One accepted request awaiting its confirm.
pub struct Exchange {
    stream: UnixStream,
    request: Vec<u8>,
}

impl Exchange {
    #[must_use]
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    /// Service type tag of the request (first two bytes), if present.
    #[must_use]
    pub fn service_type(&self) -> Option<u16> {
        let mut area = DisassemblyArea::new(&self.request);
        area.read_u16().ok()
    }

    /// Send the confirm and close the connection.
    pub fn reply(mut self, bytes: &[u8]) -> Result<()> {
        write_message(&mut self.stream, bytes)
    }
}

/// Client-side one-shot exchange.
pub fn round_trip(path: &Path, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let mut stream = UnixStream::connect(path)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    write_message(&mut stream, request)?;
    read_message(&mut stream)
}

/// Convenience: serialize a request via a closure over an assembly area.
pub fn encode_message<F>(capacity: usize, build: F) -> Vec<u8>
where
    F: FnOnce(&mut AssemblyArea<'_>) -> crate::wire::AreaResult<()>,
{
    let mut buf = vec![0u8; capacity];
    let mut area = AssemblyArea::new(&mut buf);
    // Encoding into a self-sized buffer cannot overflow unless the caller
    // lied about capacity; surface that as an empty message, which every
    // decoder rejects.
    if build(&mut area).is_err() {
        return Vec::new();
    }
    let used = area.used();
    buf.truncate(used);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn socket_path(tag: &str) -> PathBuf {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("dcp-cmdsock-{tag}-{ts}"))
    }

    #[test]
    fn test_round_trip() {
        let path = socket_path("rt");
        let server = CommandServer::bind(&path, Duration::from_millis(500)).expect("bind failed");

        let client_path = path.clone();
        let client = thread::spawn(move || {
            round_trip(&client_path, &[0x00, 0x07, 1, 2, 3], Duration::from_millis(500))
                .expect("round trip failed")
        });

        let exchange = loop {
            if let Some(ex) = server.poll_request().expect("poll failed") {
                break ex;
            }
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(exchange.service_type(), Some(0x0007));
        assert_eq!(exchange.request(), &[0x00, 0x07, 1, 2, 3]);
        exchange.reply(&[0x00, 0x07, 0, 0]).expect("reply failed");

        assert_eq!(client.join().unwrap(), vec![0x00, 0x07, 0, 0]);
    }

    #[test]
    fn test_poll_without_client() {
        let path = socket_path("idle");
        let server = CommandServer::bind(&path, Duration::from_millis(100)).expect("bind failed");
        assert!(server.poll_request().expect("poll failed").is_none());
    }

    #[test]
    fn test_stale_socket_file_is_replaced() {
        let path = socket_path("stale");
        {
            let _server =
                CommandServer::bind(&path, Duration::from_millis(100)).expect("first bind");
        }
        let _server = CommandServer::bind(&path, Duration::from_millis(100)).expect("rebind");
    }

    #[test]
    fn test_encode_message() {
        let bytes = encode_message(16, |area| {
            area.write_u16(0x1234)?;
            area.write_u8(9)
        });
        assert_eq!(bytes, vec![0x12, 0x34, 9]);
    }
}
