//! The frame clock: logical frame counter plus deterministic time base.
//!
//! All time that intercepted code observes comes from here.  The clock only
//! moves when the frame barrier advances it (or when the presenting thread
//! sleeps, or busy-polls the time, see [`FrameClock::add_delay`] and
//! [`FrameClock::query`]).  Wall-clock time is used for one thing only:
//! pacing frame crossings so that playback runs at a watchable speed.

use std::time::{Duration, Instant};

use crate::verified::clock::{self as arith, NANOS_PER_SEC};

/// Deterministic time as `(sec, nsec)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticks {
    pub sec: u64,
    pub nsec: u32,
}

impl Ticks {
    pub fn from_nanos(ns: u64) -> Self {
        let (sec, nsec) = arith::split_ns(ns);
        Self { sec, nsec }
    }

    pub fn as_nanos(&self) -> u64 {
        arith::join_ns(self.sec, self.nsec)
    }

    pub fn as_timespec(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }
}

/// Everything a checkpoint needs to put the clock back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    pub frame: u64,
    pub ticks_ns: u64,
    pub frac: u64,
    pub pending_delay_ns: u64,
}

impl ClockState {
    pub fn ticks(&self) -> Ticks {
        Ticks::from_nanos(self.ticks_ns)
    }
}

#[derive(Debug, Clone)]
pub struct FrameClock {
    state: ClockState,
    fps_num: u32,
    fps_den: u32,
    query_threshold: u32,
    queries: u32,
}

impl FrameClock {
    /// A clock running at `fps_num / fps_den` frames per second, starting
    /// at `initial_ns` of deterministic time.
    pub fn new(fps_num: u32, fps_den: u32, initial_ns: u64, query_threshold: u32) -> Self {
        Self {
            state: ClockState {
                ticks_ns: initial_ns,
                ..ClockState::default()
            },
            fps_num: fps_num.max(1),
            fps_den: fps_den.max(1),
            query_threshold,
            queries: 0,
        }
    }

    pub fn frame(&self) -> u64 {
        self.state.frame
    }

    pub fn ticks(&self) -> Ticks {
        self.state.ticks()
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    /// Length of the next frame step, without consuming the fraction.
    pub fn step_ns(&self) -> u64 {
        arith::frame_step(self.fps_num, self.fps_den, self.state.frac).0
    }

    /// Complete one frame.
    pub fn advance(&mut self) -> ClockState {
        let (step, frac) = arith::frame_step(self.fps_num, self.fps_den, self.state.frac);
        let (advance, pending) = arith::settle_delay(step, self.state.pending_delay_ns);
        self.state.frac = frac;
        self.state.pending_delay_ns = pending;
        self.state.ticks_ns = self.state.ticks_ns.saturating_add(advance);
        self.state.frame += 1;
        self.queries = 0;
        self.state
    }

    /// A sleep on the presenting thread: time moves now, and the next frame
    /// is shortened by the same amount.
    pub fn add_delay(&mut self, ns: u64) {
        self.state.ticks_ns = self.state.ticks_ns.saturating_add(ns);
        self.state.pending_delay_ns = self.state.pending_delay_ns.saturating_add(ns);
    }

    /// Read the time on behalf of intercepted code.
    ///
    /// A program that polls the clock in a loop waiting for it to move would
    /// spin forever inside one frame, so every `query_threshold` reads in
    /// the same frame push time forward by one frame step.
    pub fn query(&mut self) -> Ticks {
        self.queries += 1;
        if arith::query_forces_advance(self.queries, self.query_threshold) {
            let step = self.step_ns();
            self.add_delay(step);
            self.queries = 0;
        }
        self.ticks()
    }

    /// Put the clock back to a checkpointed state.
    pub fn reset(&mut self, state: ClockState) {
        self.state = state;
        self.queries = 0;
    }
}

/// Real-time pacing of frame crossings.
#[derive(Debug)]
pub struct Pacer {
    divisor: u32,
    fast_forward: bool,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(divisor: u32, fast_forward: bool) -> Self {
        Self {
            divisor: divisor.max(1),
            fast_forward,
            last: None,
        }
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    pub fn fast_forward(&self) -> bool {
        self.fast_forward
    }

    /// Zero is rejected by the barrier before it gets here.
    pub fn set_divisor(&mut self, divisor: u32) {
        debug_assert!(divisor > 0);
        self.divisor = divisor.max(1);
    }

    pub fn set_fast_forward(&mut self, on: bool) {
        self.fast_forward = on;
        self.last = None;
    }

    /// How long to wait before the crossing that follows a frame of
    /// `step_ns`, measured from the previous crossing.
    pub fn remaining(&self, step_ns: u64, now: Instant) -> Duration {
        let interval = arith::pacing_interval_ns(step_ns, self.divisor, self.fast_forward);
        match self.last {
            Some(last) if interval > 0 => {
                let due = last + Duration::from_nanos(interval);
                due.saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        }
    }

    /// Sleep until the next crossing is due, then mark it.
    pub fn pace(&mut self, step_ns: u64) {
        let wait = self.remaining(step_ns, Instant::now());
        if !wait.is_zero() && wait.as_nanos() < 10 * NANOS_PER_SEC as u128 {
            std::thread::sleep(wait);
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_frame_and_ticks() {
        let mut c = FrameClock::new(60, 1, 0, 0);
        let s = c.advance();
        assert_eq!(s.frame, 1);
        assert_eq!(s.ticks_ns, 16_666_666);
        for _ in 0..59 {
            c.advance();
        }
        assert_eq!(c.frame(), 60);
        assert_eq!(c.ticks(), Ticks { sec: 1, nsec: 0 });
    }

    #[test]
    fn delay_shortens_next_frame() {
        let mut c = FrameClock::new(100, 1, 0, 0);
        c.add_delay(4_000_000);
        assert_eq!(c.ticks().as_nanos(), 4_000_000);
        c.advance();
        assert_eq!(c.ticks().as_nanos(), 10_000_000);

        c.add_delay(25_000_000);
        c.advance();
        assert_eq!(c.ticks().as_nanos(), 35_000_000);
        // 15 ms of the long sleep is still owed; the next frame is free.
        c.advance();
        assert_eq!(c.ticks().as_nanos(), 35_000_000);
        c.advance();
        assert_eq!(c.ticks().as_nanos(), 40_000_000);
    }

    #[test]
    fn polling_the_clock_eventually_moves_it() {
        let mut c = FrameClock::new(50, 1, 0, 3);
        assert_eq!(c.query().as_nanos(), 0);
        assert_eq!(c.query().as_nanos(), 0);
        assert_eq!(c.query().as_nanos(), 20_000_000);
        c.advance();
        assert_eq!(c.ticks().as_nanos(), 20_000_000);
    }

    #[test]
    fn reset_restores_exact_state() {
        let mut c = FrameClock::new(60, 1, 5, 0);
        c.advance();
        c.add_delay(3);
        let saved = c.state();
        c.advance();
        c.advance();
        c.reset(saved);
        assert_eq!(c.state(), saved);
    }

    #[test]
    fn initial_time_offsets_ticks() {
        let c = FrameClock::new(60, 1, 1_500_000_000, 0);
        assert_eq!(c.ticks(), Ticks { sec: 1, nsec: 500_000_000 });
        assert_eq!(c.frame(), 0);
    }

    #[test]
    fn pacer_remaining() {
        let mut p = Pacer::new(2, false);
        let t0 = Instant::now();
        assert_eq!(p.remaining(1_000_000, t0), Duration::ZERO);
        p.last = Some(t0);
        assert_eq!(p.remaining(1_000_000, t0), Duration::from_millis(2));
        p.set_fast_forward(true);
        assert_eq!(p.remaining(1_000_000, t0), Duration::ZERO);
    }
}
