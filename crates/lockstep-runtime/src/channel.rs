//! Control channel endpoint on the injected side.
//!
//! One controller, one connection, strictly synchronous: every command read
//! is answered by exactly one reply before the next read (except
//! `Terminate`, which closes the session).  The framing itself lives in
//! `lockstep-protocol`; this module moves bytes.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use lockstep_protocol::{self as proto, Command, Header, ProtocolError, Reply, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD};
use log::{debug, info};
use thiserror::Error;

/// Socket path used when none is configured.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/lockstep.socket";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("socket {0} already exists; another instance owns the session")]
    AlreadyBound(PathBuf),
    #[error("I/O error on control channel: {0}")]
    Io(#[from] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Byte stream a session runs over.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// The injected side of a controller connection.
pub struct ControlSession {
    stream: Box<dyn Transport>,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession").finish_non_exhaustive()
    }
}

impl ControlSession {
    pub fn new(stream: impl Transport + 'static) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    /// Bind `path`, wait for the controller to connect, and stop listening.
    pub fn accept(path: &Path) -> Result<Self, ChannelError> {
        if path.exists() {
            return Err(ChannelError::AlreadyBound(path.to_path_buf()));
        }
        let listener = UnixListener::bind(path)?;
        info!("waiting for controller on {}", path.display());
        let accepted = listener.accept();
        drop(listener);
        let _ = std::fs::remove_file(path);
        let (stream, _) = accepted?;
        debug!("controller connected");
        Ok(Self::new(stream))
    }

    /// Announce ourselves.  Sent once, before the first command is read.
    pub fn send_hello(&mut self, identity: u64) -> Result<(), ChannelError> {
        self.send_reply(&Reply::Hello {
            version: proto::PROTOCOL_VERSION,
            pid: std::process::id(),
            identity,
        })
    }

    /// Read the next command.  `Ok(None)` means the controller went away,
    /// which the caller treats as `Terminate`.
    pub fn recv_command(&mut self) -> Result<Option<Command>, ChannelError> {
        let mut head = [0u8; HEADER_SIZE];
        if !read_full(&mut *self.stream, &mut head)? {
            return Ok(None);
        }
        let header = Header::decode(&head);
        let len = proto::validate_command_header(&header)?;
        let mut payload = [0u8; MAX_PAYLOAD];
        if !read_full(&mut *self.stream, &mut payload[..len])? {
            return Ok(None);
        }
        Ok(Some(Command::decode(&header, &payload[..len])?))
    }

    pub fn send_reply(&mut self, reply: &Reply) -> Result<(), ChannelError> {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let n = reply.encode(&mut buf);
        self.stream.write_all(&buf[..n])?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Fill `buf`.  Returns `false` on end of stream or a reset connection.
fn read_full(stream: &mut dyn Transport, buf: &mut [u8]) -> Result<bool, ChannelError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
