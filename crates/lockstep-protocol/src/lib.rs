//! Wire protocol for the lockstep controller ↔ injected runtime link.
//!
//! This crate defines the message framing, command codes, reply codes and
//! the fixed [`InputVector`] layout exchanged over the control channel.
//! It is `no_std`-compatible with zero required dependencies.
//!
//! # Transport
//!
//! The channel is a stream socket.  Every message is an 8-byte header
//! followed by a payload whose length is fixed by the message code:
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ─────────────
//! 0x00    4     code          (u32, little endian)
//! 0x04    4     payload len   (u32, little endian)
//! 0x08    len   payload
//! ```
//!
//! The link is strictly synchronous:
//!
//! 1. On session open the runtime sends one [`Reply::Hello`]
//! 2. Controller sends exactly one [`Command`]
//! 3. Runtime answers with exactly one [`Reply`] (except `Terminate`)
//! 4. Repeat from 2
//!
//! A header with an unknown code, or a length that does not match the
//! code's fixed payload size, is a [`ProtocolError`] and ends the session.

#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt;

/// Protocol revision carried in [`Reply::Hello`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload any message carries.
pub const MAX_PAYLOAD: usize = INPUT_VECTOR_SIZE;

/// Largest encoded message.
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;

// ═══════════════════════════════════════════════════════════════════════
//  Command codes (controller → runtime)
// ═══════════════════════════════════════════════════════════════════════

/// Install the attached inputs and advance one frame.
pub const CMD_FRAME_ADVANCE: u32 = 0x01;

/// Capture the process into a slot.
pub const CMD_SAVE_STATE: u32 = 0x02;

/// Restore the process from a slot.
pub const CMD_LOAD_STATE: u32 = 0x03;

/// Throttle real-time pacing of frame crossings.
pub const CMD_SET_SPEED_DIVISOR: u32 = 0x04;

/// Enable or disable real-time pacing entirely.
pub const CMD_SET_FAST_FORWARD: u32 = 0x05;

/// End the session and exit the target process.
pub const CMD_TERMINATE: u32 = 0x0F;

// ═══════════════════════════════════════════════════════════════════════
//  Reply codes (runtime → controller)
// ═══════════════════════════════════════════════════════════════════════

/// Session greeting, sent once before the first command is read.
pub const REPLY_HELLO: u32 = 0x80;

/// Frame advanced; carries the post-advance clock.
pub const REPLY_FRAME_ACK: u32 = 0x81;

/// Result of a save.
pub const REPLY_SAVE_ACK: u32 = 0x82;

/// Result of a load.
pub const REPLY_LOAD_ACK: u32 = 0x83;

/// Setting accepted.
pub const REPLY_ACK: u32 = 0x84;

/// Command rejected; carries an [`ErrorCode`].
pub const REPLY_ERROR: u32 = 0x8F;

// ═══════════════════════════════════════════════════════════════════════
//  Error codes
// ═══════════════════════════════════════════════════════════════════════

/// Error codes carried by `SaveAck`/`LoadAck` failures and `Error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    UnknownSlot = 1,
    IdentityMismatch = 2,
    StorageExhausted = 3,
    EngineFailure = 4,
    InvalidDivisor = 5,
    NotQuiescent = 6,
    SuspendFailed = 7,
    SlotInvalid = 8,
    PresenterMismatch = 9,
}

impl ErrorCode {
    /// Decode a wire value.  Unknown values are `None`.
    pub const fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::UnknownSlot,
            2 => Self::IdentityMismatch,
            3 => Self::StorageExhausted,
            4 => Self::EngineFailure,
            5 => Self::InvalidDivisor,
            6 => Self::NotQuiescent,
            7 => Self::SuspendFailed,
            8 => Self::SlotInvalid,
            9 => Self::PresenterMismatch,
            _ => return None,
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "no error",
            Self::UnknownSlot => "unknown slot",
            Self::IdentityMismatch => "executable identity mismatch",
            Self::StorageExhausted => "checkpoint storage exhausted",
            Self::EngineFailure => "checkpoint engine failure",
            Self::InvalidDivisor => "speed divisor must be non-zero",
            Self::NotQuiescent => "not at a frame boundary",
            Self::SuspendFailed => "thread suspension failed",
            Self::SlotInvalid => "slot invalidated by an interrupted save",
            Self::PresenterMismatch => "presenting thread differs from the saved one",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Input vector
// ═══════════════════════════════════════════════════════════════════════

/// Maximum number of simultaneously pressed keys.
pub const MAX_KEYS: usize = 16;

/// Number of game controllers carried per frame.
pub const MAX_CONTROLLERS: usize = 4;

/// Analog axes per controller (left x/y, right x/y, triggers).
pub const AXES_PER_CONTROLLER: usize = 6;

const POINTER_SIZE: usize = 16;
const CONTROLLER_SIZE: usize = AXES_PER_CONTROLLER * 2 + 2;

/// Encoded size of an [`InputVector`].
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    64    keys          (16 × u32 key symbol, 0 = empty)
/// 0x40    16    pointer       (x i32, y i32, buttons u32, mode u32)
/// 0x50    56    controllers   (4 × { 6 × i16 axes, u16 buttons })
/// 0x88    4     flags
/// ```
pub const INPUT_VECTOR_SIZE: usize = MAX_KEYS * 4 + POINTER_SIZE + MAX_CONTROLLERS * CONTROLLER_SIZE + 4;

/// Pointer device state for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PointerState {
    pub x: i32,
    pub y: i32,
    /// Bitmask of pressed buttons, bit 0 = primary.
    pub buttons: u32,
    /// 0 = absolute, 1 = relative.
    pub mode: u32,
}

/// One game controller's state for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControllerState {
    pub axes: [i16; AXES_PER_CONTROLLER],
    pub buttons: u16,
}

/// Complete input state driving one frame.
///
/// Replaced wholesale on every `FrameAdvance`.  The default value is the
/// all-released vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InputVector {
    /// Pressed key symbols; unused entries are zero.
    pub keys: [u32; MAX_KEYS],
    pub pointer: PointerState,
    pub controllers: [ControllerState; MAX_CONTROLLERS],
    /// Miscellaneous per-frame flags (window focus, restart request, ...).
    pub flags: u32,
}

impl InputVector {
    /// Whether nothing is pressed, moved or flagged.
    pub fn is_released(&self) -> bool {
        *self == Self::default()
    }

    /// Whether `keysym` is among the pressed keys.
    pub fn is_key_down(&self, keysym: u32) -> bool {
        keysym != 0 && self.keys.contains(&keysym)
    }

    /// Press `keysym` into the first free key entry.  Returns `false` when
    /// all entries are taken.
    pub fn press_key(&mut self, keysym: u32) -> bool {
        if keysym == 0 || self.is_key_down(keysym) {
            return keysym != 0;
        }
        match self.keys.iter_mut().find(|k| **k == 0) {
            Some(slot) => {
                *slot = keysym;
                true
            }
            None => false,
        }
    }

    /// Write the fixed layout into `buf`.
    pub fn encode(&self, buf: &mut [u8; INPUT_VECTOR_SIZE]) {
        let mut w = Writer::new(buf);
        for k in &self.keys {
            w.u32(*k);
        }
        w.i32(self.pointer.x);
        w.i32(self.pointer.y);
        w.u32(self.pointer.buttons);
        w.u32(self.pointer.mode);
        for c in &self.controllers {
            for a in &c.axes {
                w.i16(*a);
            }
            w.u16(c.buttons);
        }
        w.u32(self.flags);
        debug_assert_eq!(w.pos, INPUT_VECTOR_SIZE);
    }

    /// Read the fixed layout from `buf`.
    pub fn decode(buf: &[u8; INPUT_VECTOR_SIZE]) -> Self {
        let mut r = Reader::new(buf);
        let mut v = Self::default();
        for k in v.keys.iter_mut() {
            *k = r.u32();
        }
        v.pointer.x = r.i32();
        v.pointer.y = r.i32();
        v.pointer.buttons = r.u32();
        v.pointer.mode = r.u32();
        for c in v.controllers.iter_mut() {
            for a in c.axes.iter_mut() {
                *a = r.i16();
            }
            c.buttons = r.u16();
        }
        v.flags = r.u32();
        v
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Messages
// ═══════════════════════════════════════════════════════════════════════

/// A command sent by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    FrameAdvance(InputVector),
    SaveState(u32),
    LoadState(u32),
    /// Zero is representable on the wire; the runtime rejects it.
    SetSpeedDivisor(u32),
    SetFastForward(bool),
    Terminate,
}

/// A reply sent by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Hello { version: u32, pid: u32, identity: u64 },
    FrameAck { frame: u64, ticks_sec: u64, ticks_nsec: u32 },
    SaveAck { ok: bool, code: ErrorCode },
    LoadAck { ok: bool, code: ErrorCode },
    Ack,
    Error(ErrorCode),
}

/// A framing or payload violation.  Always fatal to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The header names a code this side does not know.
    UnknownCode(u32),
    /// The header length disagrees with the code's fixed payload size.
    BadLength { code: u32, expected: u32, actual: u32 },
    /// The payload is the right size but carries an invalid value.
    BadPayload { code: u32 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCode(c) => write!(f, "unknown message code {c:#x}"),
            Self::BadLength { code, expected, actual } => write!(
                f,
                "message {code:#x} has payload length {actual}, expected {expected}"
            ),
            Self::BadPayload { code } => write!(f, "message {code:#x} has an invalid payload"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ProtocolError {}

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub code: u32,
    pub len: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&self.code.to_le_bytes());
        buf[4..].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            code: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Fixed payload length for a command code.
pub const fn command_payload_len(code: u32) -> Option<usize> {
    Some(match code {
        CMD_FRAME_ADVANCE => INPUT_VECTOR_SIZE,
        CMD_SAVE_STATE | CMD_LOAD_STATE | CMD_SET_SPEED_DIVISOR | CMD_SET_FAST_FORWARD => 4,
        CMD_TERMINATE => 0,
        _ => return None,
    })
}

/// Fixed payload length for a reply code.
pub const fn reply_payload_len(code: u32) -> Option<usize> {
    Some(match code {
        REPLY_HELLO => 16,
        REPLY_FRAME_ACK => 20,
        REPLY_SAVE_ACK | REPLY_LOAD_ACK => 8,
        REPLY_ACK => 0,
        REPLY_ERROR => 4,
        _ => return None,
    })
}

/// Check a header against the command table and return the payload size.
pub fn validate_command_header(h: &Header) -> Result<usize, ProtocolError> {
    validate(h, command_payload_len(h.code))
}

/// Check a header against the reply table and return the payload size.
pub fn validate_reply_header(h: &Header) -> Result<usize, ProtocolError> {
    validate(h, reply_payload_len(h.code))
}

fn validate(h: &Header, expected: Option<usize>) -> Result<usize, ProtocolError> {
    let expected = expected.ok_or(ProtocolError::UnknownCode(h.code))?;
    if h.len as usize != expected {
        return Err(ProtocolError::BadLength {
            code: h.code,
            expected: expected as u32,
            actual: h.len,
        });
    }
    Ok(expected)
}

impl Command {
    pub const fn code(&self) -> u32 {
        match self {
            Self::FrameAdvance(_) => CMD_FRAME_ADVANCE,
            Self::SaveState(_) => CMD_SAVE_STATE,
            Self::LoadState(_) => CMD_LOAD_STATE,
            Self::SetSpeedDivisor(_) => CMD_SET_SPEED_DIVISOR,
            Self::SetFastForward(_) => CMD_SET_FAST_FORWARD,
            Self::Terminate => CMD_TERMINATE,
        }
    }

    /// Encode header and payload into `buf`.  Returns the message length.
    pub fn encode(&self, buf: &mut [u8; MAX_MESSAGE_SIZE]) -> usize {
        let code = self.code();
        // Every code produced by `code()` is in the table.
        let len = command_payload_len(code).unwrap_or(0);
        buf[..HEADER_SIZE].copy_from_slice(&Header { code, len: len as u32 }.encode());
        let payload = &mut buf[HEADER_SIZE..HEADER_SIZE + len];
        match self {
            Self::FrameAdvance(inputs) => {
                let mut fixed = [0u8; INPUT_VECTOR_SIZE];
                inputs.encode(&mut fixed);
                payload.copy_from_slice(&fixed);
            }
            Self::SaveState(v) | Self::LoadState(v) | Self::SetSpeedDivisor(v) => {
                payload.copy_from_slice(&v.to_le_bytes());
            }
            Self::SetFastForward(on) => payload.copy_from_slice(&(*on as u32).to_le_bytes()),
            Self::Terminate => {}
        }
        HEADER_SIZE + len
    }

    /// Decode a payload for an already validated header.
    pub fn decode(h: &Header, payload: &[u8]) -> Result<Self, ProtocolError> {
        let len = validate_command_header(h)?;
        if payload.len() != len {
            return Err(ProtocolError::BadLength {
                code: h.code,
                expected: len as u32,
                actual: payload.len() as u32,
            });
        }
        let word = || u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(match h.code {
            CMD_FRAME_ADVANCE => {
                let mut fixed = [0u8; INPUT_VECTOR_SIZE];
                fixed.copy_from_slice(payload);
                Self::FrameAdvance(InputVector::decode(&fixed))
            }
            CMD_SAVE_STATE => Self::SaveState(word()),
            CMD_LOAD_STATE => Self::LoadState(word()),
            CMD_SET_SPEED_DIVISOR => Self::SetSpeedDivisor(word()),
            CMD_SET_FAST_FORWARD => match word() {
                0 => Self::SetFastForward(false),
                1 => Self::SetFastForward(true),
                _ => return Err(ProtocolError::BadPayload { code: h.code }),
            },
            CMD_TERMINATE => Self::Terminate,
            other => return Err(ProtocolError::UnknownCode(other)),
        })
    }
}

impl Reply {
    pub const fn code(&self) -> u32 {
        match self {
            Self::Hello { .. } => REPLY_HELLO,
            Self::FrameAck { .. } => REPLY_FRAME_ACK,
            Self::SaveAck { .. } => REPLY_SAVE_ACK,
            Self::LoadAck { .. } => REPLY_LOAD_ACK,
            Self::Ack => REPLY_ACK,
            Self::Error(_) => REPLY_ERROR,
        }
    }

    /// Encode header and payload into `buf`.  Returns the message length.
    pub fn encode(&self, buf: &mut [u8; MAX_MESSAGE_SIZE]) -> usize {
        let code = self.code();
        let len = reply_payload_len(code).unwrap_or(0);
        buf[..HEADER_SIZE].copy_from_slice(&Header { code, len: len as u32 }.encode());
        let mut w = Writer::new(&mut buf[HEADER_SIZE..HEADER_SIZE + len]);
        match *self {
            Self::Hello { version, pid, identity } => {
                w.u32(version);
                w.u32(pid);
                w.u64(identity);
            }
            Self::FrameAck { frame, ticks_sec, ticks_nsec } => {
                w.u64(frame);
                w.u64(ticks_sec);
                w.u32(ticks_nsec);
            }
            Self::SaveAck { ok, code } | Self::LoadAck { ok, code } => {
                w.u32(ok as u32);
                w.u32(code as u32);
            }
            Self::Ack => {}
            Self::Error(code) => w.u32(code as u32),
        }
        HEADER_SIZE + len
    }

    pub fn decode(h: &Header, payload: &[u8]) -> Result<Self, ProtocolError> {
        let len = validate_reply_header(h)?;
        if payload.len() != len {
            return Err(ProtocolError::BadLength {
                code: h.code,
                expected: len as u32,
                actual: payload.len() as u32,
            });
        }
        let bad = ProtocolError::BadPayload { code: h.code };
        let mut r = Reader::new(payload);
        Ok(match h.code {
            REPLY_HELLO => Self::Hello {
                version: r.u32(),
                pid: r.u32(),
                identity: r.u64(),
            },
            REPLY_FRAME_ACK => Self::FrameAck {
                frame: r.u64(),
                ticks_sec: r.u64(),
                ticks_nsec: r.u32(),
            },
            REPLY_SAVE_ACK | REPLY_LOAD_ACK => {
                let ok = match r.u32() {
                    0 => false,
                    1 => true,
                    _ => return Err(bad),
                };
                let code = ErrorCode::from_u32(r.u32()).ok_or(bad)?;
                if h.code == REPLY_SAVE_ACK {
                    Self::SaveAck { ok, code }
                } else {
                    Self::LoadAck { ok, code }
                }
            }
            REPLY_ACK => Self::Ack,
            REPLY_ERROR => Self::Error(ErrorCode::from_u32(r.u32()).ok_or(bad)?),
            other => return Err(ProtocolError::UnknownCode(other)),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Little-endian cursor helpers
// ═══════════════════════════════════════════════════════════════════════

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put<const N: usize>(&mut self, bytes: [u8; N]) {
        self.buf[self.pos..self.pos + N].copy_from_slice(&bytes);
        self.pos += N;
    }

    fn u16(&mut self, v: u16) {
        self.put(v.to_le_bytes());
    }
    fn i16(&mut self, v: i16) {
        self.put(v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.put(v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.put(v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.put(v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }
    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }
    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }
    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(buf: &[u8; MAX_MESSAGE_SIZE], n: usize) -> (Header, &[u8]) {
        let mut h = [0u8; HEADER_SIZE];
        h.copy_from_slice(&buf[..HEADER_SIZE]);
        (Header::decode(&h), &buf[HEADER_SIZE..n])
    }

    #[test]
    fn input_vector_size_matches_layout() {
        assert_eq!(INPUT_VECTOR_SIZE, 140);
        assert_eq!(MAX_MESSAGE_SIZE, 148);
    }

    #[test]
    fn released_vector_encodes_to_zeros() {
        let mut buf = [0xAAu8; INPUT_VECTOR_SIZE];
        InputVector::default().encode(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
        assert!(InputVector::decode(&buf).is_released());
    }

    #[test]
    fn input_vector_field_offsets() {
        let mut v = InputVector::default();
        v.keys[0] = 0x61;
        v.pointer.x = -5;
        v.controllers[3].buttons = 0x8001;
        v.flags = 0xDEAD_BEEF;
        let mut buf = [0u8; INPUT_VECTOR_SIZE];
        v.encode(&mut buf);
        assert_eq!(&buf[0..4], &0x61u32.to_le_bytes());
        assert_eq!(&buf[0x40..0x44], &(-5i32).to_le_bytes());
        // controller 3 buttons: 0x50 + 3*14 + 12
        assert_eq!(&buf[0x50 + 42 + 12..0x50 + 42 + 14], &0x8001u16.to_le_bytes());
        assert_eq!(&buf[0x88..0x8C], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(InputVector::decode(&buf), v);
    }

    #[test]
    fn press_key_fills_first_free_entry() {
        let mut v = InputVector::default();
        assert!(v.press_key(10));
        assert!(v.press_key(10));
        assert_eq!(v.keys.iter().filter(|k| **k == 10).count(), 1);
        for k in 11..(11 + MAX_KEYS as u32 - 1) {
            assert!(v.press_key(k));
        }
        assert!(!v.press_key(999));
        assert!(!v.press_key(0));
    }

    #[test]
    fn frame_advance_with_released_inputs() {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let n = Command::FrameAdvance(InputVector::default()).encode(&mut buf);
        assert_eq!(n, HEADER_SIZE + INPUT_VECTOR_SIZE);
        let (h, payload) = split(&buf, n);
        assert_eq!(
            Command::decode(&h, payload).unwrap(),
            Command::FrameAdvance(InputVector::default())
        );
    }

    #[test]
    fn speed_divisor_zero_is_representable() {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let n = Command::SetSpeedDivisor(0).encode(&mut buf);
        let (h, payload) = split(&buf, n);
        assert_eq!(Command::decode(&h, payload).unwrap(), Command::SetSpeedDivisor(0));
    }

    #[test]
    fn unknown_command_code_is_rejected() {
        let h = Header { code: 0x7E, len: 0 };
        assert_eq!(validate_command_header(&h), Err(ProtocolError::UnknownCode(0x7E)));
    }

    #[test]
    fn wrong_length_is_rejected() {
        let h = Header { code: CMD_SAVE_STATE, len: 8 };
        assert_eq!(
            validate_command_header(&h),
            Err(ProtocolError::BadLength { code: CMD_SAVE_STATE, expected: 4, actual: 8 })
        );
        let h = Header { code: CMD_TERMINATE, len: 1 };
        assert!(validate_command_header(&h).is_err());
    }

    #[test]
    fn fast_forward_rejects_non_boolean() {
        let h = Header { code: CMD_SET_FAST_FORWARD, len: 4 };
        assert_eq!(
            Command::decode(&h, &2u32.to_le_bytes()),
            Err(ProtocolError::BadPayload { code: CMD_SET_FAST_FORWARD })
        );
    }

    #[test]
    fn reply_codes_do_not_decode_as_commands() {
        let h = Header { code: REPLY_FRAME_ACK, len: 20 };
        assert!(validate_command_header(&h).is_err());
    }

    #[test]
    fn frame_ack_layout() {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let reply = Reply::FrameAck { frame: 7, ticks_sec: 1, ticks_nsec: 500 };
        let n = reply.encode(&mut buf);
        assert_eq!(n, HEADER_SIZE + 20);
        assert_eq!(&buf[HEADER_SIZE..HEADER_SIZE + 8], &7u64.to_le_bytes());
        let (h, payload) = split(&buf, n);
        assert_eq!(Reply::decode(&h, payload).unwrap(), reply);
    }

    #[test]
    fn save_ack_failure_carries_code() {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let reply = Reply::SaveAck { ok: false, code: ErrorCode::StorageExhausted };
        let n = reply.encode(&mut buf);
        let (h, payload) = split(&buf, n);
        assert_eq!(Reply::decode(&h, payload).unwrap(), reply);
    }

    #[test]
    fn unknown_error_code_is_bad_payload() {
        let h = Header { code: REPLY_ERROR, len: 4 };
        assert_eq!(
            Reply::decode(&h, &99u32.to_le_bytes()),
            Err(ProtocolError::BadPayload { code: REPLY_ERROR })
        );
    }

    #[test]
    fn command_and_reply_codes_are_disjoint() {
        for code in 0..0x100u32 {
            assert!(
                !(command_payload_len(code).is_some() && reply_payload_len(code).is_some()),
                "code {code:#x} is both a command and a reply"
            );
        }
    }
}
