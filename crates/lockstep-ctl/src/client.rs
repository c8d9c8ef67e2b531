//! Blocking controller client.
//!
//! The injected side speaks first with `Hello`, then answers every command
//! with exactly one reply.  `Terminate` is the exception: it has no reply
//! and ends the session.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use lockstep_protocol::{
    self as proto, Command, ErrorCode, Header, InputVector, ProtocolError, Reply, HEADER_SIZE, MAX_MESSAGE_SIZE,
    MAX_PAYLOAD,
};
use log::{debug, info};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("I/O error on control channel"), context(false))]
    Io { source: io::Error },

    #[snafu(display("protocol violation"), context(false))]
    Protocol { source: ProtocolError },

    #[snafu(display("no injected process listening on {path} after {waited:?}"))]
    ConnectTimeout { path: String, waited: Duration },

    #[snafu(display("injected process speaks protocol version {version}, expected {}", proto::PROTOCOL_VERSION))]
    VersionMismatch { version: u32 },

    #[snafu(display("injected process closed the session"))]
    Disconnected,

    #[snafu(display("unexpected reply {reply:?} to {command}"))]
    Unexpected { command: &'static str, reply: Reply },

    #[snafu(display("{command} refused: {}", code.as_str()))]
    Refused { command: &'static str, code: ErrorCode },
}

/// What the injected process announced when the session opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub pid: u32,
    /// Executable identity; slots only load into a matching executable.
    pub identity: u64,
}

/// A completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAck {
    pub frame: u64,
    pub ticks_sec: u64,
    pub ticks_nsec: u32,
}

pub struct ControllerClient<S = UnixStream> {
    stream: S,
    hello: Hello,
}

impl ControllerClient<UnixStream> {
    /// Connect to the socket at `path`, retrying until the injected process
    /// starts listening or `timeout` passes.
    pub fn connect(path: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let start = Instant::now();
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    info!("connected to {}", path.display());
                    return Self::from_stream(stream);
                }
                Err(e) if start.elapsed() < timeout => {
                    debug!("connect to {}: {}", path.display(), e);
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => {
                    return ConnectTimeoutSnafu {
                        path: path.display().to_string(),
                        waited: start.elapsed(),
                    }
                    .fail()
                }
            }
        }
    }
}

impl<S: Read + Write> ControllerClient<S> {
    /// Open a session over an established stream.  Reads `Hello`.
    pub fn from_stream(mut stream: S) -> Result<Self, ClientError> {
        let hello = match recv(&mut stream)? {
            Reply::Hello { version, pid, identity } => {
                if version != proto::PROTOCOL_VERSION {
                    return VersionMismatchSnafu { version }.fail();
                }
                Hello { pid, identity }
            }
            reply => return UnexpectedSnafu { command: "session start", reply }.fail(),
        };
        info!("session with pid {} (identity {:#x})", hello.pid, hello.identity);
        Ok(Self { stream, hello })
    }

    pub fn hello(&self) -> Hello {
        self.hello
    }

    /// Run one frame with `inputs`.
    pub fn advance(&mut self, inputs: &InputVector) -> Result<FrameAck, ClientError> {
        match self.call(&Command::FrameAdvance(*inputs))? {
            Reply::FrameAck {
                frame,
                ticks_sec,
                ticks_nsec,
            } => Ok(FrameAck {
                frame,
                ticks_sec,
                ticks_nsec,
            }),
            reply => UnexpectedSnafu { command: "FrameAdvance", reply }.fail(),
        }
    }

    pub fn save(&mut self, slot: u32) -> Result<(), ClientError> {
        match self.call(&Command::SaveState(slot))? {
            Reply::SaveAck { ok: true, .. } => Ok(()),
            Reply::SaveAck { ok: false, code } | Reply::Error(code) => RefusedSnafu { command: "SaveState", code }.fail(),
            reply => UnexpectedSnafu { command: "SaveState", reply }.fail(),
        }
    }

    pub fn load(&mut self, slot: u32) -> Result<(), ClientError> {
        match self.call(&Command::LoadState(slot))? {
            Reply::LoadAck { ok: true, .. } => Ok(()),
            Reply::LoadAck { ok: false, code } | Reply::Error(code) => RefusedSnafu { command: "LoadState", code }.fail(),
            reply => UnexpectedSnafu { command: "LoadState", reply }.fail(),
        }
    }

    pub fn set_speed_divisor(&mut self, divisor: u32) -> Result<(), ClientError> {
        self.expect_ack("SetSpeedDivisor", &Command::SetSpeedDivisor(divisor))
    }

    pub fn set_fast_forward(&mut self, on: bool) -> Result<(), ClientError> {
        self.expect_ack("SetFastForward", &Command::SetFastForward(on))
    }

    /// End the session.  The injected process exits without replying.
    pub fn terminate(mut self) -> Result<(), ClientError> {
        send(&mut self.stream, &Command::Terminate)?;
        Ok(())
    }

    fn expect_ack(&mut self, command: &'static str, cmd: &Command) -> Result<(), ClientError> {
        match self.call(cmd)? {
            Reply::Ack => Ok(()),
            Reply::Error(code) => RefusedSnafu { command, code }.fail(),
            reply => UnexpectedSnafu { command, reply }.fail(),
        }
    }

    fn call(&mut self, cmd: &Command) -> Result<Reply, ClientError> {
        debug!("-> {:?}", cmd);
        send(&mut self.stream, cmd)?;
        let reply = recv(&mut self.stream)?;
        debug!("<- {:?}", reply);
        Ok(reply)
    }
}

fn send(stream: &mut impl Write, cmd: &Command) -> Result<(), ClientError> {
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    let n = cmd.encode(&mut buf);
    stream.write_all(&buf[..n])?;
    stream.flush()?;
    Ok(())
}

fn recv(stream: &mut impl Read) -> Result<Reply, ClientError> {
    let mut head = [0u8; HEADER_SIZE];
    read_full(stream, &mut head)?;
    let header = Header::decode(&head);
    let len = proto::validate_reply_header(&header)?;
    let mut payload = [0u8; MAX_PAYLOAD];
    read_full(stream, &mut payload[..len])?;
    Ok(Reply::decode(&header, &payload[..len])?)
}

fn read_full(stream: &mut impl Read, buf: &mut [u8]) -> Result<(), ClientError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset) => {
            DisconnectedSnafu.fail()
        }
        Err(e) => Err(e.into()),
    }
}
