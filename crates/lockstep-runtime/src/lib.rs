//! lockstep runtime — the core of an injected record/replay instance.
//!
//! Loaded into a target process, the runtime makes its execution a pure
//! function of the controller's input sequence: time only moves when a
//! frame is presented, randomness comes from a seeded stream, and the
//! whole process can be checkpointed and restored at frame boundaries.
//!
//! # Architecture
//!
//! - [`alloc`] — mmap-backed arena; the injected instance's global allocator
//! - [`thread_state`] — per-thread reentrancy counters and guards
//! - [`symbols`] — memoized lookup of the real implementations
//! - [`clock`] — deterministic frame clock and real-time pacing
//! - [`barrier`] — frame barrier and deterministic waits
//! - [`entropy`] — seeded random stream
//! - [`checkpoint`] — whole-process save and restore
//! - [`channel`] — control channel endpoint
//! - [`config`] — configuration from file and environment
//! - [`logging`] — `env_logger` behind the no-log guard
//! - [`runtime`] — everything above, assembled
//! - [`verified`] — pure arithmetic kept free of side effects

pub mod alloc;
pub mod barrier;
pub mod channel;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod entropy;
pub mod logging;
pub mod runtime;
pub mod symbols;
pub mod thread_state;
pub mod verified;

pub use barrier::{Crossing, FrameBarrier, FrameToken, LinkState, WaitOutcome};
pub use config::RuntimeConfig;
pub use runtime::{Runtime, RuntimeError};

/// Report a fatal condition and abort.
///
/// Used where the process state can no longer be trusted, so nothing here
/// allocates or takes a lock.
pub(crate) fn die(msg: &str) -> ! {
    die_with(msg, None)
}

/// [`die`] with a number appended, formatted on the stack.
pub(crate) fn die_with(msg: &str, value: Option<i64>) -> ! {
    const PREFIX: &[u8] = b"lockstep: fatal: ";
    let mut digits = [0u8; 21];
    let n = value.map_or(0, |v| format_decimal(v, &mut digits));
    // SAFETY: writes from valid buffers to stderr.
    unsafe {
        libc::write(2, PREFIX.as_ptr().cast(), PREFIX.len());
        libc::write(2, msg.as_ptr().cast(), msg.len());
        if n > 0 {
            libc::write(2, b" ".as_ptr().cast(), 1);
            libc::write(2, digits[digits.len() - n..].as_ptr().cast(), n);
        }
        libc::write(2, b"\n".as_ptr().cast(), 1);
    }
    std::process::abort()
}

/// Write `v` right-aligned into `buf`, returning the number of bytes used.
fn format_decimal(v: i64, buf: &mut [u8; 21]) -> usize {
    let mut mag = v.unsigned_abs();
    let mut at = buf.len();
    loop {
        at -= 1;
        buf[at] = b'0' + (mag % 10) as u8;
        mag /= 10;
        if mag == 0 {
            break;
        }
    }
    if v < 0 {
        at -= 1;
        buf[at] = b'-';
    }
    buf.len() - at
}

#[cfg(test)]
mod tests {
    use super::format_decimal;

    fn fmt(v: i64) -> String {
        let mut buf = [0u8; 21];
        let n = format_decimal(v, &mut buf);
        String::from_utf8(buf[buf.len() - n..].to_vec()).unwrap()
    }

    #[test]
    fn fatal_numbers_format_without_allocating() {
        assert_eq!(fmt(0), "0");
        assert_eq!(fmt(4071), "4071");
        assert_eq!(fmt(-12), "-12");
        assert_eq!(fmt(i64::MIN), i64::MIN.to_string());
        assert_eq!(fmt(i64::MAX), i64::MAX.to_string());
    }
}
