//! The frame barrier: the one point where the controller gets to speak.
//!
//! Every presented frame crosses the barrier.  The first surface to report
//! a frame is the canonical one: it serves controller commands until a
//! `FrameAdvance` arrives, installs the new inputs, advances the clock and
//! returns.  Other surfaces reporting the same frame see that the clock has
//! moved on and return without touching the channel.
//!
//! Secondary threads never block on real time.  Their sleeps and timed
//! waits park on a condition variable that is signalled whenever the clock
//! moves, so they wake at the same frame on every run.  Sleeps on the
//! presenting thread cannot park (nothing else would advance the clock)
//! and become a delay folded into the next frame instead.
//!
//! After a protocol error the session is dropped and the barrier runs
//! detached: frames advance with the last inputs and no rendezvous.

use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard};

use lockstep_protocol::{Command, ErrorCode, InputVector, Reply};
use log::{debug, error, info, warn};

use crate::channel::{ChannelError, ControlSession};
use crate::checkpoint::{CheckpointManager, FrameState, SaveOutcome};
use crate::clock::{FrameClock, Pacer, Ticks};
use crate::entropy::DeterministicEntropy;
use crate::thread_state::gettid;

/// The frame a surface is about to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameToken {
    frame: u64,
}

impl FrameToken {
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

/// What a crossing did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    /// This call completed the frame.
    Advanced { frame: u64, ticks: Ticks },
    /// Another surface completed the frame first.
    Observed { frame: u64, ticks: Ticks },
    /// The controller ended the session; the process must exit.
    Terminated,
}

/// Proof that the caller is inside a barrier crossing, with every other
/// thread either parked or running application code outside the runtime.
#[derive(Debug)]
pub struct QuiescentPoint {
    frame: u64,
    _not_send: PhantomData<*const ()>,
}

impl QuiescentPoint {
    pub(crate) fn new(frame: u64) -> Self {
        Self {
            frame,
            _not_send: PhantomData,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Detached,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Terminated,
}

/// State every thread reads.
struct Shared {
    clock: FrameClock,
    inputs: InputVector,
    entropy: DeterministicEntropy,
    presenter: Option<i32>,
    terminated: bool,
}

impl Shared {
    fn snapshot(&self) -> FrameState {
        FrameState {
            clock: self.clock.state(),
            inputs: self.inputs,
            entropy: self.entropy.state(),
        }
    }

    fn reinstate(&mut self, state: &FrameState) {
        self.clock.reset(state.clock);
        self.inputs = state.inputs;
        self.entropy.restore(&state.entropy);
    }

    fn is_presenter(&self) -> bool {
        self.presenter == Some(gettid())
    }
}

/// State only the crossing thread touches.
struct Link {
    session: Option<ControlSession>,
    pacer: Pacer,
}

/// Lock order: `link` before `state`.
pub struct FrameBarrier {
    state: Mutex<Shared>,
    advanced: Condvar,
    link: Mutex<Link>,
    checkpoints: Option<CheckpointManager>,
}

impl FrameBarrier {
    pub fn new(clock: FrameClock, entropy: DeterministicEntropy, pacer: Pacer) -> Self {
        Self {
            state: Mutex::new(Shared {
                clock,
                inputs: InputVector::default(),
                entropy,
                presenter: None,
                terminated: false,
            }),
            advanced: Condvar::new(),
            link: Mutex::new(Link { session: None, pacer }),
            checkpoints: None,
        }
    }

    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    /// Start serving `session`, announcing the process first.
    pub fn attach(&self, mut session: ControlSession, identity: u64) -> Result<(), ChannelError> {
        session.send_hello(identity)?;
        lock(&self.link).session = Some(session);
        Ok(())
    }

    /// Mark the calling thread as the one that presents frames.
    pub fn set_presenter(&self) {
        lock(&self.state).presenter = Some(gettid());
    }

    pub fn presenter(&self) -> Option<i32> {
        lock(&self.state).presenter
    }

    pub fn link_state(&self) -> LinkState {
        if lock(&self.state).terminated {
            return LinkState::Terminated;
        }
        match lock(&self.link).session {
            Some(_) => LinkState::Connected,
            None => LinkState::Detached,
        }
    }

    pub fn speed_divisor(&self) -> u32 {
        lock(&self.link).pacer.divisor()
    }

    pub fn fast_forward(&self) -> bool {
        lock(&self.link).pacer.fast_forward()
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Reads
    // ═══════════════════════════════════════════════════════════════════

    pub fn token(&self) -> FrameToken {
        FrameToken {
            frame: lock(&self.state).clock.frame(),
        }
    }

    pub fn frame(&self) -> u64 {
        lock(&self.state).clock.frame()
    }

    /// The deterministic time, as intercepted clock reads see it.
    pub fn now(&self) -> Ticks {
        let mut st = lock(&self.state);
        if st.is_presenter() {
            st.clock.query()
        } else {
            st.clock.ticks()
        }
    }

    pub fn inputs(&self) -> InputVector {
        lock(&self.state).inputs
    }

    pub fn fill_random(&self, buf: &mut [u8]) {
        lock(&self.state).entropy.fill(buf);
    }

    pub fn c_rand(&self) -> i32 {
        lock(&self.state).entropy.next_c_rand()
    }

    pub fn is_terminated(&self) -> bool {
        lock(&self.state).terminated
    }

    pub fn snapshot(&self) -> FrameState {
        lock(&self.state).snapshot()
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Crossing
    // ═══════════════════════════════════════════════════════════════════

    /// Report that the frame named by `token` is being presented.
    pub fn cross(&self, token: FrameToken) -> Crossing {
        let mut link = lock(&self.link);
        {
            let mut st = lock(&self.state);
            if st.terminated {
                return Crossing::Terminated;
            }
            if st.clock.frame() > token.frame {
                return Crossing::Observed {
                    frame: st.clock.frame(),
                    ticks: st.clock.ticks(),
                };
            }
            st.presenter = Some(gettid());
        }
        self.serve(&mut link)
    }

    /// Answer commands until one of them ends the frame.
    ///
    /// A load of a rewinding checkpoint re-enters this loop in the frame
    /// that saved it, so nothing here may own heap data across a command.
    fn serve(&self, link: &mut Link) -> Crossing {
        loop {
            let Some(session) = link.session.as_mut() else {
                return self.advance(link, None);
            };
            let cmd = match session.recv_command() {
                Ok(Some(cmd)) => cmd,
                Ok(None) => {
                    info!("controller went away");
                    link.session = None;
                    return self.terminate();
                }
                Err(e) => {
                    error!("control channel failed, running detached: {}", e);
                    link.session = None;
                    continue;
                }
            };
            debug!("command {:?}", cmd);
            let reply = match cmd {
                Command::FrameAdvance(inputs) => return self.advance(link, Some(inputs)),
                Command::Terminate => {
                    info!("terminate requested");
                    link.session = None;
                    return self.terminate();
                }
                Command::SetSpeedDivisor(0) => Reply::Error(ErrorCode::InvalidDivisor),
                Command::SetSpeedDivisor(n) => {
                    link.pacer.set_divisor(n);
                    Reply::Ack
                }
                Command::SetFastForward(on) => {
                    link.pacer.set_fast_forward(on);
                    Reply::Ack
                }
                Command::SaveState(slot) => self.save(slot),
                Command::LoadState(slot) => self.load(slot),
            };
            self.reply(link, &reply);
        }
    }

    fn reply(&self, link: &mut Link, reply: &Reply) {
        if let Some(session) = link.session.as_mut() {
            if let Err(e) = session.send_reply(reply) {
                error!("cannot reply to controller, running detached: {}", e);
                link.session = None;
            }
        }
    }

    fn advance(&self, link: &mut Link, inputs: Option<InputVector>) -> Crossing {
        let (state, step) = {
            let mut st = lock(&self.state);
            if let Some(inputs) = inputs {
                st.inputs = inputs;
            }
            let state = st.clock.advance();
            self.advanced.notify_all();
            (state, st.clock.step_ns())
        };
        link.pacer.pace(step);
        let ticks = state.ticks();
        self.reply(
            link,
            &Reply::FrameAck {
                frame: state.frame,
                ticks_sec: ticks.sec,
                ticks_nsec: ticks.nsec,
            },
        );
        Crossing::Advanced {
            frame: state.frame,
            ticks,
        }
    }

    fn terminate(&self) -> Crossing {
        lock(&self.state).terminated = true;
        self.advanced.notify_all();
        Crossing::Terminated
    }

    fn save(&self, slot: u32) -> Reply {
        let Some(manager) = self.checkpoints.as_ref() else {
            return Reply::SaveAck {
                ok: false,
                code: ErrorCode::EngineFailure,
            };
        };
        let mut st = lock(&self.state);
        let at = QuiescentPoint::new(st.clock.frame());
        let snapshot = st.snapshot();
        match manager.save(&at, slot, snapshot) {
            Ok(SaveOutcome::Saved) => {
                info!("saved slot {} at frame {}", slot, at.frame());
                Reply::SaveAck {
                    ok: true,
                    code: ErrorCode::None,
                }
            }
            Ok(SaveOutcome::Restored { state, .. }) => {
                st.reinstate(&state);
                self.advanced.notify_all();
                Reply::LoadAck {
                    ok: true,
                    code: ErrorCode::None,
                }
            }
            Err(e) => {
                warn!("save to slot {} failed: {}", slot, e);
                Reply::SaveAck { ok: false, code: e.code() }
            }
        }
    }

    fn load(&self, slot: u32) -> Reply {
        let Some(manager) = self.checkpoints.as_ref() else {
            return Reply::LoadAck {
                ok: false,
                code: ErrorCode::EngineFailure,
            };
        };
        let mut st = lock(&self.state);
        let at = QuiescentPoint::new(st.clock.frame());
        match manager.load(&at, slot) {
            Ok(state) => {
                st.reinstate(&state);
                self.advanced.notify_all();
                Reply::LoadAck {
                    ok: true,
                    code: ErrorCode::None,
                }
            }
            Err(e) => {
                warn!("load of slot {} failed: {}", slot, e);
                Reply::LoadAck { ok: false, code: e.code() }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Deterministic waits
    // ═══════════════════════════════════════════════════════════════════

    /// Sleep for `ns` of deterministic time.
    pub fn sleep(&self, ns: u64) -> WaitOutcome {
        let deadline = Ticks::from_nanos(lock(&self.state).clock.ticks().as_nanos().saturating_add(ns));
        self.sleep_until(deadline)
    }

    /// Sleep until the clock reads `deadline`.
    pub fn sleep_until(&self, deadline: Ticks) -> WaitOutcome {
        match self.timed_wait(deadline, || false) {
            WaitOutcome::TimedOut => WaitOutcome::Ready,
            other => other,
        }
    }

    /// Wait until `ready` holds or the clock reaches `deadline`.
    ///
    /// `ready` is evaluated with the barrier locked, on entry and after
    /// every clock movement.  It must not call back into the barrier.
    pub fn timed_wait(&self, deadline: Ticks, mut ready: impl FnMut() -> bool) -> WaitOutcome {
        let mut st = lock(&self.state);
        if st.is_presenter() {
            if ready() {
                return WaitOutcome::Ready;
            }
            let now = st.clock.ticks().as_nanos();
            let target = deadline.as_nanos();
            if target > now {
                st.clock.add_delay(target - now);
            }
            return WaitOutcome::TimedOut;
        }
        loop {
            if st.terminated {
                return WaitOutcome::Terminated;
            }
            if ready() {
                return WaitOutcome::Ready;
            }
            if st.clock.ticks() >= deadline {
                return WaitOutcome::TimedOut;
            }
            st = self.advanced.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the frame after `frame` has started.  A blocking poll
    /// becomes ready here.  The presenting thread never blocks.
    pub fn wait_for_frame(&self, frame: u64) -> WaitOutcome {
        let mut st = lock(&self.state);
        if st.is_presenter() {
            return WaitOutcome::Ready;
        }
        loop {
            if st.terminated {
                return WaitOutcome::Terminated;
            }
            if st.clock.frame() > frame {
                return WaitOutcome::Ready;
            }
            st = self.advanced.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::peer;
    use crate::checkpoint::RegionEngine;
    use crate::thread_state::ThreadTable;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    fn barrier(seed: u64) -> FrameBarrier {
        FrameBarrier::new(FrameClock::new(60, 1, 0, 0), DeterministicEntropy::new(seed), Pacer::new(1, true))
    }

    fn connected(b: &FrameBarrier) -> UnixStream {
        let (a, mut ctl) = UnixStream::pair().unwrap();
        b.attach(ControlSession::new(a), 7).unwrap();
        assert!(matches!(peer::recv(&mut ctl), Reply::Hello { identity: 7, .. }));
        ctl
    }

    fn keys(k: u32) -> InputVector {
        let mut v = InputVector::default();
        v.press_key(k);
        v
    }

    fn frame_ack(r: Reply) -> (u64, u64, u32) {
        match r {
            Reply::FrameAck { frame, ticks_sec, ticks_nsec } => (frame, ticks_sec, ticks_nsec),
            other => panic!("expected FrameAck, got {other:?}"),
        }
    }

    /// Run a scripted session and collect what the game would observe.
    fn run_script(seed: u64) -> Vec<(u64, u64, u32, bool, i32)> {
        let b = barrier(seed);
        let mut ctl = connected(&b);
        for k in 1..=5 {
            peer::send(&mut ctl, &Command::FrameAdvance(keys(k)));
        }
        let mut seen = Vec::new();
        for k in 1..=5 {
            assert!(matches!(b.cross(b.token()), Crossing::Advanced { .. }));
            let (frame, sec, nsec) = frame_ack(peer::recv(&mut ctl));
            seen.push((frame, sec, nsec, b.inputs().is_key_down(k), b.c_rand()));
        }
        seen
    }

    #[test]
    fn same_commands_same_observations() {
        let a = run_script(42);
        let b = run_script(42);
        assert_eq!(a, b);
        assert_eq!(a.last().unwrap().0, 5);
        assert!(a.iter().all(|s| s.3));
        assert_eq!(a.iter().map(|s| s.0).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn second_surface_in_a_frame_observes() {
        let b = barrier(0);
        let mut ctl = connected(&b);
        peer::send(&mut ctl, &Command::FrameAdvance(keys(1)));
        let token = b.token();
        assert!(matches!(b.cross(token), Crossing::Advanced { frame: 1, .. }));
        assert!(matches!(b.cross(token), Crossing::Observed { frame: 1, .. }));
        assert_eq!(b.frame(), 1);
    }

    #[test]
    fn concurrent_surfaces_complete_the_frame_once() {
        let b = Arc::new(barrier(0));
        let mut ctl = connected(&b);
        peer::send(&mut ctl, &Command::FrameAdvance(keys(1)));
        let token = b.token();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let b = b.clone();
                std::thread::spawn(move || b.cross(token))
            })
            .collect();
        let results: Vec<Crossing> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let advanced = results.iter().filter(|c| matches!(c, Crossing::Advanced { .. })).count();
        assert_eq!(advanced, 1);
        assert_eq!(b.frame(), 1);
    }

    #[test]
    fn zero_divisor_is_refused_without_change() {
        let b = barrier(0);
        let mut ctl = connected(&b);
        peer::send(&mut ctl, &Command::SetSpeedDivisor(0));
        peer::send(&mut ctl, &Command::SetSpeedDivisor(4));
        peer::send(&mut ctl, &Command::SetFastForward(false));
        peer::send(&mut ctl, &Command::FrameAdvance(keys(1)));
        assert!(matches!(b.cross(b.token()), Crossing::Advanced { .. }));
        assert_eq!(peer::recv(&mut ctl), Reply::Error(ErrorCode::InvalidDivisor));
        assert_eq!(peer::recv(&mut ctl), Reply::Ack);
        assert_eq!(peer::recv(&mut ctl), Reply::Ack);
        frame_ack(peer::recv(&mut ctl));
        assert_eq!(b.speed_divisor(), 4);
        assert!(!b.fast_forward());
    }

    #[test]
    fn protocol_error_detaches_and_keeps_running() {
        let b = barrier(0);
        let mut ctl = connected(&b);
        peer::send(&mut ctl, &Command::FrameAdvance(keys(9)));
        assert!(matches!(b.cross(b.token()), Crossing::Advanced { frame: 1, .. }));
        peer::send_raw(&mut ctl, 0x55, &[]);
        assert!(matches!(b.cross(b.token()), Crossing::Advanced { frame: 2, .. }));
        assert_eq!(b.link_state(), LinkState::Detached);
        // Detached frames keep the last inputs.
        assert!(b.inputs().is_key_down(9));
        assert!(matches!(b.cross(b.token()), Crossing::Advanced { frame: 3, .. }));
    }

    #[test]
    fn disconnect_terminates() {
        let b = barrier(0);
        let ctl = connected(&b);
        drop(ctl);
        assert_eq!(b.cross(b.token()), Crossing::Terminated);
        assert_eq!(b.link_state(), LinkState::Terminated);
        assert_eq!(b.cross(b.token()), Crossing::Terminated);
    }

    #[test]
    fn terminate_releases_parked_threads() {
        let b = Arc::new(barrier(0));
        let mut ctl = connected(&b);
        b.set_presenter();
        let sleepers: Vec<_> = (0..3)
            .map(|_| {
                let b = b.clone();
                std::thread::spawn(move || b.sleep(3_600_000_000_000))
            })
            .collect();
        std::thread::sleep(std::time::Duration::from_millis(20));
        peer::send(&mut ctl, &Command::Terminate);
        assert_eq!(b.cross(b.token()), Crossing::Terminated);
        for s in sleepers {
            assert_eq!(s.join().unwrap(), WaitOutcome::Terminated);
        }
    }

    #[test]
    fn secondary_sleep_wakes_on_frame_advance() {
        let b = Arc::new(barrier(0));
        let mut ctl = connected(&b);
        b.set_presenter();
        let sleeper = {
            let b = b.clone();
            std::thread::spawn(move || {
                let r = b.sleep(10_000_000);
                (r, b.frame())
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!sleeper.is_finished());
        peer::send(&mut ctl, &Command::FrameAdvance(keys(1)));
        b.cross(b.token());
        assert_eq!(sleeper.join().unwrap(), (WaitOutcome::Ready, 1));
    }

    #[test]
    fn presenter_sleep_becomes_delay() {
        let b = barrier(0);
        let mut ctl = connected(&b);
        b.set_presenter();
        assert_eq!(b.sleep(5_000_000), WaitOutcome::Ready);
        assert_eq!(b.now().as_nanos(), 5_000_000);
        peer::send(&mut ctl, &Command::FrameAdvance(keys(1)));
        b.cross(b.token());
        assert_eq!(b.now().as_nanos(), 16_666_666);
    }

    #[test]
    fn poll_is_ready_at_next_frame() {
        let b = Arc::new(barrier(0));
        let mut ctl = connected(&b);
        b.set_presenter();
        let start = b.frame();
        let poller = {
            let b = b.clone();
            std::thread::spawn(move || b.wait_for_frame(start))
        };
        peer::send(&mut ctl, &Command::FrameAdvance(keys(1)));
        b.cross(b.token());
        assert_eq!(poller.join().unwrap(), WaitOutcome::Ready);
        assert_eq!(b.wait_for_frame(start), WaitOutcome::Ready);
    }

    #[test]
    fn save_and_load_through_the_channel() {
        let buf: &'static mut [u8; 32] = Box::leak(Box::new([0u8; 32]));
        let mut engine = RegionEngine::new();
        unsafe { engine.track(buf.as_mut_ptr(), buf.len()) };
        let threads: &'static ThreadTable = Box::leak(Box::new(ThreadTable::new()));
        let b = barrier(5).with_checkpoints(CheckpointManager::new(Box::new(engine), 0, threads));
        let mut ctl = connected(&b);

        peer::send(&mut ctl, &Command::FrameAdvance(keys(1)));
        peer::send(&mut ctl, &Command::SaveState(1));
        peer::send(&mut ctl, &Command::FrameAdvance(keys(2)));
        b.cross(b.token());
        buf[0] = 0xAA;
        let rand_after_save = {
            b.cross(b.token());
            b.c_rand()
        };
        assert_eq!(frame_ack(peer::recv(&mut ctl)).0, 1);
        assert_eq!(
            peer::recv(&mut ctl),
            Reply::SaveAck {
                ok: true,
                code: ErrorCode::None
            }
        );
        assert_eq!(frame_ack(peer::recv(&mut ctl)).0, 2);

        buf[0] = 0xBB;
        peer::send(&mut ctl, &Command::LoadState(1));
        peer::send(&mut ctl, &Command::LoadState(9));
        peer::send(&mut ctl, &Command::FrameAdvance(keys(3)));
        b.cross(b.token());
        assert_eq!(
            peer::recv(&mut ctl),
            Reply::LoadAck {
                ok: true,
                code: ErrorCode::None
            }
        );
        assert_eq!(
            peer::recv(&mut ctl),
            Reply::LoadAck {
                ok: false,
                code: ErrorCode::UnknownSlot
            }
        );
        // Back at frame 1, so the next advance is frame 2 again.
        assert_eq!(frame_ack(peer::recv(&mut ctl)).0, 2);
        assert_eq!(buf[0], 0xAA);
        assert!(b.inputs().is_key_down(3));
        assert_eq!(b.c_rand(), rand_after_save);
    }

    #[test]
    fn checkpoint_commands_without_a_manager_fail_cleanly() {
        let b = barrier(0);
        let mut ctl = connected(&b);
        peer::send(&mut ctl, &Command::SaveState(1));
        peer::send(&mut ctl, &Command::FrameAdvance(keys(1)));
        b.cross(b.token());
        assert_eq!(
            peer::recv(&mut ctl),
            Reply::SaveAck {
                ok: false,
                code: ErrorCode::EngineFailure
            }
        );
    }
}
