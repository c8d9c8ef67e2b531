//! Deterministic time arithmetic.
//!
//! Every function in this module is:
//! - **Pure**: no I/O, no system calls, no side effects beyond the return value.
//! - **Deterministic**: same inputs always produce the same outputs.
//!
//! # Frame step
//!
//! A frame lasts `1e9 * den / num` nanoseconds.  The division remainder is
//! carried in a fractional accumulator (in units of `1/num` ns) so that,
//! e.g., 60 fps never drifts: after 60 frames exactly one second elapsed.
//!
//! # Deferred delay
//!
//! A sleep on the presenting thread advances ticks immediately and is
//! remembered as pending delay.  The next frame then only advances by what
//! is left of its step, so a frame lasts `max(step, slept)`.

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Advance of one frame at `num/den` frames per second.
///
/// Returns `(step_ns, new_frac)`.
///
/// # Panics (debug only)
///
/// `num` must be non-zero and `frac < num`.
pub fn frame_step(num: u32, den: u32, frac: u64) -> (u64, u64) {
    debug_assert!(num > 0, "framerate numerator must be non-zero");
    debug_assert!(frac < num as u64, "fractional accumulator out of range");

    let total = NANOS_PER_SEC as u128 * den as u128;
    let mut step = (total / num as u128) as u64;
    let mut frac = frac + (total % num as u128) as u64;
    if frac >= num as u64 {
        frac -= num as u64;
        step += 1;
    }

    debug_assert!(frac < num as u64);
    (step, frac)
}

/// Split a frame step into the tick advance still owed after `pending`
/// nanoseconds of deferred sleep.
///
/// Returns `(advance_ns, new_pending)`.  `advance_ns + (pending - new_pending)`
/// always equals `step`, or exceeds it when the sleep was longer.
pub fn settle_delay(step: u64, pending: u64) -> (u64, u64) {
    if pending >= step {
        (0, pending - step)
    } else {
        (step - pending, 0)
    }
}

/// Whether the `count`-th time query inside one frame should force time
/// forward.  A zero threshold disables the mechanism.
pub fn query_forces_advance(count: u32, threshold: u32) -> bool {
    threshold != 0 && count >= threshold
}

/// Split nanoseconds into `(sec, nsec)`.
pub fn split_ns(ns: u64) -> (u64, u32) {
    (ns / NANOS_PER_SEC, (ns % NANOS_PER_SEC) as u32)
}

/// Join `(sec, nsec)` into nanoseconds, saturating.
pub fn join_ns(sec: u64, nsec: u32) -> u64 {
    sec.saturating_mul(NANOS_PER_SEC).saturating_add(nsec as u64)
}

/// Real time that should separate two frame crossings.
///
/// `divisor` slows playback down (2 = half speed).  Fast-forward removes
/// pacing entirely.
pub fn pacing_interval_ns(step: u64, divisor: u32, fast_forward: bool) -> u64 {
    if fast_forward {
        0
    } else {
        step.saturating_mul(divisor.max(1) as u64)
    }
}
