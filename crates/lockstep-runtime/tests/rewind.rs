//! Save, run on, and load back with the mappings engine.
//!
//! Runs without the test harness: a rewinding load restores every stack in
//! the process, so the test must own all of its threads.  The arena is the
//! global allocator, as in the injected instance, which keeps everything
//! the test wants to survive the load out of the capture set.
//!
//! `main` crosses the frame that saves twice.  The first pass mutates the
//! process and asks for the load; the second pass continues from the save
//! and checks that the process looks the way it did then.

use std::alloc::{GlobalAlloc, Layout};
use std::hint::black_box;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use lockstep_protocol::{self as proto, Command, ErrorCode, Header, InputVector, Reply, HEADER_SIZE, MAX_MESSAGE_SIZE};
use lockstep_runtime::alloc::{ARENA, PAGE_SIZE};
use lockstep_runtime::channel::ControlSession;
use lockstep_runtime::checkpoint::clone::{find_tid_offset, tid_slot};
use lockstep_runtime::checkpoint::{CheckpointManager, MappingsEngine};
use lockstep_runtime::clock::{FrameClock, Pacer, Ticks};
use lockstep_runtime::entropy::DeterministicEntropy;
use lockstep_runtime::thread_state::ThreadTable;
use lockstep_runtime::{Crossing, FrameBarrier};

struct Arena;

unsafe impl GlobalAlloc for Arena {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ARENA.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        ARENA.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        ARENA.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static GLOBAL: Arena = Arena;

/// Program state in static memory: rewound by a load.
static SCORE: AtomicU64 = AtomicU64::new(0);

const BLOCK: &[u8; 8] = b"saved-01";
const CLOBBER: &[u8; 8] = b"changed!";

/// Bookkeeping in the arena: survives a load.
#[derive(Default)]
struct Shared {
    passes: AtomicU32,

    // Parked at the save and at the load, resumed into its saved context.
    a_tid: AtomicI32,
    a_turn: AtomicU64,
    a_echo: AtomicU64,
    a_steps: AtomicU64,

    // Parked at the save, gone by the load, recreated from its record.
    b_thread: AtomicUsize,
    b_tid: AtomicI32,
    b_turn: AtomicU64,
    b_echo: AtomicU64,
    b_steps: AtomicU64,
    b_stop: AtomicBool,
    b_done: AtomicU32,

    // Created after the save, told to exit by the load.
    c_tid: AtomicI32,
    c_spins: AtomicU64,

    block: AtomicUsize,
    fresh: AtomicUsize,
    frame2: AtomicU64,
    frame3: AtomicU64,
    rand_after_save: AtomicI32,
}

struct Fixture {
    table: &'static ThreadTable,
    barrier: &'static FrameBarrier,
    shared: &'static Shared,
}

fn main() {
    let table: &'static ThreadTable = Box::leak(Box::new(ThreadTable::new()));
    let shared: &'static Shared = Box::leak(Box::default());
    let manager = CheckpointManager::new(Box::new(MappingsEngine::new()), 0, table);
    let barrier: &'static FrameBarrier = Box::leak(Box::new(
        FrameBarrier::new(
            FrameClock::new(60, 1, 1_000_000_000, 0),
            DeterministicEntropy::new(7),
            Pacer::new(1, true),
        )
        .with_checkpoints(manager),
    ));
    let fx: &'static Fixture = Box::leak(Box::new(Fixture { table, barrier, shared }));

    let (ours, mut ctl) = UnixStream::pair().unwrap();
    ctl.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
    barrier.attach(ControlSession::new(ours), 1).unwrap();
    assert!(matches!(recv(&mut ctl), Reply::Hello { identity: 1, .. }));

    std::thread::spawn(move || stepper(fx));
    let mut b: libc::pthread_t = 0;
    let r = unsafe { libc::pthread_create(&mut b, std::ptr::null(), counter_thread, fx as *const Fixture as *mut _) };
    assert_eq!(r, 0);
    shared.b_thread.store(b as usize, Ordering::SeqCst);
    wait_until("threads registered", || {
        shared.a_tid.load(Ordering::SeqCst) != 0 && shared.b_tid.load(Ordering::SeqCst) != 0
    });

    shared.a_turn.store(3, Ordering::SeqCst);
    shared.b_turn.store(2, Ordering::SeqCst);
    wait_until("threads caught up", || {
        shared.a_echo.load(Ordering::SeqCst) == 3 && shared.b_echo.load(Ordering::SeqCst) == 2
    });

    SCORE.store(1, Ordering::SeqCst);
    let block = unsafe { libc::malloc(BLOCK.len()) } as *mut u8;
    assert!(!block.is_null());
    unsafe { std::ptr::copy_nonoverlapping(BLOCK.as_ptr(), block, BLOCK.len()) };
    shared.block.store(block as usize, Ordering::SeqCst);
    let mut stack_bytes = [1u8; 256];
    black_box(&mut stack_bytes);
    println!("rewind: saving at frame 1");

    send(&mut ctl, &Command::FrameAdvance(keys(1)));
    assert!(matches!(barrier.cross(barrier.token()), Crossing::Advanced { frame: 1, .. }));

    send(&mut ctl, &Command::SaveState(1));
    send(&mut ctl, &Command::FrameAdvance(keys(2)));
    let crossing = barrier.cross(barrier.token());

    if shared.passes.fetch_add(1, Ordering::SeqCst) == 0 {
        run_ahead_and_load(fx, &mut ctl, crossing, &mut stack_bytes);
    }
    check_restored(fx, &mut ctl, crossing, &mut stack_bytes);
    println!("rewind: ok");
}

/// First pass: change everything a load must undo, then load.
fn run_ahead_and_load(fx: &'static Fixture, ctl: &mut UnixStream, crossing: Crossing, stack_bytes: &mut [u8; 256]) -> ! {
    let (barrier, shared) = (fx.barrier, fx.shared);
    let Crossing::Advanced { frame: 2, ticks } = crossing else {
        panic!("expected frame 2, got {crossing:?}");
    };
    assert!(barrier.inputs().is_key_down(2));
    shared.frame2.store(ticks.as_nanos(), Ordering::SeqCst);
    shared.rand_after_save.store(barrier.c_rand(), Ordering::SeqCst);
    assert!(barrier.checkpoints().is_some_and(|m| m.slots().contains(1)));

    SCORE.store(99, Ordering::SeqCst);
    let block = shared.block.load(Ordering::SeqCst) as *mut u8;
    unsafe { std::ptr::copy_nonoverlapping(CLOBBER.as_ptr(), block, CLOBBER.len()) };
    stack_bytes.fill(2);
    black_box(&mut *stack_bytes);

    let fresh = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(fresh, libc::MAP_FAILED);
    unsafe { *(fresh as *mut u8) = 5 };
    shared.fresh.store(fresh as usize, Ordering::SeqCst);

    std::thread::spawn(move || latecomer(fx));
    wait_until("latecomer registered", || shared.c_tid.load(Ordering::SeqCst) != 0);

    shared.a_turn.store(10, Ordering::SeqCst);
    wait_until("stepper ran ahead", || shared.a_echo.load(Ordering::SeqCst) == 10);
    assert_eq!(shared.a_steps.load(Ordering::SeqCst), 10);

    shared.b_turn.store(5, Ordering::SeqCst);
    wait_until("counter ran ahead", || shared.b_echo.load(Ordering::SeqCst) == 5);
    shared.b_stop.store(true, Ordering::SeqCst);
    let b = shared.b_thread.load(Ordering::SeqCst) as libc::pthread_t;
    assert_eq!(unsafe { libc::pthread_join(b, std::ptr::null_mut()) }, 0);
    assert_eq!(shared.b_done.load(Ordering::SeqCst), 1);
    assert_eq!(shared.b_steps.load(Ordering::SeqCst), 5);

    for frame in 3..=5 {
        send(ctl, &Command::FrameAdvance(keys(frame as u32)));
        match barrier.cross(barrier.token()) {
            Crossing::Advanced { frame: f, ticks } if f == frame => {
                if frame == 3 {
                    shared.frame3.store(ticks.as_nanos(), Ordering::SeqCst);
                }
            }
            other => panic!("expected frame {frame}, got {other:?}"),
        }
    }

    send(ctl, &Command::LoadState(1));
    send(ctl, &Command::FrameAdvance(keys(6)));
    let crossing = barrier.cross(barrier.token());
    panic!("load returned to the frame that asked for it: {crossing:?}");
}

/// Second pass: back in the frame that saved, with the saved process.
fn check_restored(fx: &Fixture, ctl: &mut UnixStream, crossing: Crossing, stack_bytes: &mut [u8; 256]) {
    let (barrier, shared) = (fx.barrier, fx.shared);
    assert_eq!(shared.passes.load(Ordering::SeqCst), 2);

    // The frame the load answered is the saved frame plus one.
    let frame2 = Ticks::from_nanos(shared.frame2.load(Ordering::SeqCst));
    assert_eq!(crossing, Crossing::Advanced { frame: 2, ticks: frame2 });
    assert_eq!(barrier.frame(), 2);
    assert!(barrier.inputs().is_key_down(6));
    assert_eq!(barrier.c_rand(), shared.rand_after_save.load(Ordering::SeqCst));

    // Program memory.
    assert_eq!(SCORE.load(Ordering::SeqCst), 1);
    let block = shared.block.load(Ordering::SeqCst) as *const u8;
    assert_eq!(unsafe { std::slice::from_raw_parts(block, BLOCK.len()) }, BLOCK);
    black_box(&mut *stack_bytes);
    assert!(stack_bytes.iter().all(|&b| b == 1));
    let fresh = shared.fresh.load(Ordering::SeqCst);
    let r = unsafe { libc::msync(fresh as *mut libc::c_void, PAGE_SIZE, libc::MS_ASYNC) };
    assert_eq!(r, -1, "mapping created after the save survived the load");
    assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::ENOMEM));

    // Resumed at 3 and counted up to 10 again.
    wait_until("stepper redone", || shared.a_steps.load(Ordering::SeqCst) == 17);
    assert_eq!(shared.a_echo.load(Ordering::SeqCst), 10);
    assert!(fx.table.find(shared.a_tid.load(Ordering::SeqCst)).is_some());
    shared.a_turn.store(11, Ordering::SeqCst);
    wait_until("stepper still running", || shared.a_echo.load(Ordering::SeqCst) == 11);

    // Recreated at 2, redid 3..=5, then saw the stop flag.
    wait_until("counter recreated", || shared.b_done.load(Ordering::SeqCst) == 2);
    assert_eq!(shared.b_steps.load(Ordering::SeqCst), 8);
    assert_eq!(shared.b_echo.load(Ordering::SeqCst), 5);
    let b = shared.b_thread.load(Ordering::SeqCst) as u64;
    let slot = tid_slot(b, find_tid_offset());
    wait_until("recreated thread's tid cleared", || unsafe { slot.0.read_volatile() } == 0);

    // Told to exit.
    assert!(fx.table.find(shared.c_tid.load(Ordering::SeqCst)).is_none());
    let spins = shared.c_spins.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(shared.c_spins.load(Ordering::SeqCst), spins);

    // What the controller saw, in order.
    let ack = |r: Reply| match r {
        Reply::FrameAck { frame, ticks_sec, ticks_nsec } => (frame, Ticks { sec: ticks_sec, nsec: ticks_nsec }),
        other => panic!("expected FrameAck, got {other:?}"),
    };
    let ok = ErrorCode::None;
    assert_eq!(ack(recv(ctl)).0, 1);
    assert_eq!(recv(ctl), Reply::SaveAck { ok: true, code: ok });
    assert_eq!(ack(recv(ctl)), (2, frame2));
    for frame in 3..=5 {
        assert_eq!(ack(recv(ctl)).0, frame);
    }
    assert_eq!(recv(ctl), Reply::LoadAck { ok: true, code: ok });
    assert_eq!(ack(recv(ctl)), (2, frame2));

    // Time goes on exactly as it did the first time.
    send(ctl, &Command::FrameAdvance(keys(7)));
    let frame3 = Ticks::from_nanos(shared.frame3.load(Ordering::SeqCst));
    assert_eq!(barrier.cross(barrier.token()), Crossing::Advanced { frame: 3, ticks: frame3 });
    assert_eq!(ack(recv(ctl)), (3, frame3));
}

/// Counts up to `a_turn` one step at a time, keeping its count on its own
/// stack.
fn stepper(fx: &'static Fixture) {
    let shared = fx.shared;
    shared.a_tid.store(fx.table.register_current().tid(), Ordering::SeqCst);
    let mut n = 0u64;
    loop {
        if shared.a_turn.load(Ordering::SeqCst) > n {
            n = black_box(n + 1);
            shared.a_echo.store(n, Ordering::SeqCst);
            shared.a_steps.fetch_add(1, Ordering::SeqCst);
        }
        std::hint::spin_loop();
    }
}

/// Like [`stepper`], but a plain pthread that leaves once stopped.
extern "C" fn counter_thread(arg: *mut libc::c_void) -> *mut libc::c_void {
    let fx = unsafe { &*(arg as *const Fixture) };
    let shared = fx.shared;
    shared.b_tid.store(fx.table.register_current().tid(), Ordering::SeqCst);
    let mut m = 0u64;
    loop {
        if shared.b_turn.load(Ordering::SeqCst) > m {
            m = black_box(m + 1);
            shared.b_echo.store(m, Ordering::SeqCst);
            shared.b_steps.fetch_add(1, Ordering::SeqCst);
        } else if shared.b_stop.load(Ordering::SeqCst) {
            break;
        }
        std::hint::spin_loop();
    }
    shared.b_done.fetch_add(1, Ordering::SeqCst);
    std::ptr::null_mut()
}

fn latecomer(fx: &'static Fixture) {
    let shared = fx.shared;
    shared.c_tid.store(fx.table.register_current().tid(), Ordering::SeqCst);
    loop {
        shared.c_spins.fetch_add(1, Ordering::SeqCst);
        std::hint::spin_loop();
    }
}

fn keys(k: u32) -> InputVector {
    let mut v = InputVector::default();
    v.press_key(k);
    v
}

fn send(stream: &mut UnixStream, cmd: &Command) {
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    let n = cmd.encode(&mut buf);
    stream.write_all(&buf[..n]).unwrap();
}

fn recv(stream: &mut UnixStream) -> Reply {
    let mut head = [0u8; HEADER_SIZE];
    stream.read_exact(&mut head).unwrap();
    let h = Header::decode(&head);
    let len = proto::validate_reply_header(&h).unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    Reply::decode(&h, &payload).unwrap()
}

fn wait_until(what: &str, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting: {what}");
        std::thread::yield_now();
    }
}
