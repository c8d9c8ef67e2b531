//! Suspension of secondary threads and capture of the presenting thread.
//!
//! A thread is parked by queueing [`SUSPEND_SIGNAL`] to it with a pointer to
//! its [`ThreadContext`] in `si_value`.  The handler runs on the thread's
//! arena-backed alternate stack, records the interrupted registers, and
//! waits on a futex until the manager releases it with one of three
//! actions: carry on, resume a different saved context, or exit.
//!
//! The presenting thread captures itself the same way with
//! [`CAPTURE_SIGNAL`]: the engine runs inside that handler so that a
//! restore can rewrite the handler's return context.
//!
//! Nothing between suspension and release may allocate or log: a parked
//! thread may be holding the lock either needs.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

use super::clone::{self, CpuRecord};
use crate::alloc::ARENA;
use crate::thread_state::ThreadContext;

pub const SUSPEND_SIGNAL: libc::c_int = libc::SIGXFSZ;
pub const CAPTURE_SIGNAL: libc::c_int = libc::SIGSYS;

/// Size of each thread's alternate signal stack.
pub const ALTSTACK_SIZE: usize = 64 * 1024;

const SI_QUEUE: i32 = -1;

const RUNNING: u32 = 0;
const SIGNALED: u32 = 1;
const SUSPENDED: u32 = 2;
const EXITED: u32 = 3;

/// How a parked thread leaves its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Resume {
    Continue = 0,
    /// Return into the context stored in the thread's record.
    Restore = 1,
    /// The thread has no counterpart in the restored image.
    Exit = 2,
}

/// Checkpoint bookkeeping embedded in every [`ThreadContext`].
pub struct ParkState {
    lifecycle: AtomicU32,
    release: AtomicU32,
    action: AtomicU32,
    record: UnsafeCell<CpuRecord>,
    altstack: AtomicUsize,
}

// SAFETY: `record` is written by the owning thread while the manager waits
// for SUSPENDED, and by the manager while the owner waits for `release`.
// The lifecycle and release words order the two.
unsafe impl Sync for ParkState {}

impl ParkState {
    pub const fn new() -> Self {
        Self {
            lifecycle: AtomicU32::new(RUNNING),
            release: AtomicU32::new(0),
            action: AtomicU32::new(Resume::Continue as u32),
            record: UnsafeCell::new(CpuRecord::zeroed()),
            altstack: AtomicUsize::new(0),
        }
    }

    pub fn is_exited(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == EXITED
    }

    pub fn is_suspended(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == SUSPENDED
    }

    pub(crate) fn mark_exited(&self) {
        self.lifecycle.store(EXITED, Ordering::Release);
    }

    pub(crate) fn mark_running(&self) {
        self.lifecycle.store(RUNNING, Ordering::Release);
    }

    /// Give the calling thread an alternate signal stack from the arena.
    pub(crate) fn install_altstack(&self) {
        install_handlers();
        let stack = match ARENA.leak_zeroed(ALTSTACK_SIZE, 16) {
            Ok(s) => s,
            Err(_) => return,
        };
        let ss = libc::stack_t {
            ss_sp: stack.as_mut_ptr() as *mut libc::c_void,
            ss_flags: 0,
            ss_size: ALTSTACK_SIZE,
        };
        // SAFETY: the stack is never freed.
        if unsafe { libc::sigaltstack(&ss, std::ptr::null_mut()) } == 0 {
            self.altstack.store(stack.as_ptr() as usize, Ordering::Relaxed);
        }
    }

    /// The alternate stack as a `stack_t` for a recreated thread.
    pub(crate) fn altstack(&self) -> clone::AltStack {
        let sp = self.altstack.load(Ordering::Relaxed) as u64;
        clone::AltStack {
            sp,
            flags: 0,
            _pad: 0,
            size: if sp == 0 { 0 } else { ALTSTACK_SIZE as u64 },
        }
    }

    /// Registers captured at suspension.  Valid only while suspended.
    pub(crate) fn record(&self) -> CpuRecord {
        // SAFETY: see the Sync impl.
        unsafe { *self.record.get() }
    }

    /// Stage the context a `Restore` action returns into.
    pub(crate) fn set_record(&self, rec: &CpuRecord) {
        // SAFETY: see the Sync impl.
        unsafe { *self.record.get() = *rec };
    }
}

impl Default for ParkState {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Signal plumbing
// ═══════════════════════════════════════════════════════════════════════

/// `siginfo_t` as filled in for `rt_tgsigqueueinfo` with `SI_QUEUE`.
#[repr(C)]
struct QueuedInfo {
    signo: i32,
    errno: i32,
    code: i32,
    _pad: i32,
    pid: i32,
    uid: u32,
    value: usize,
    _rest: [u64; 12],
}

const _: () = assert!(std::mem::size_of::<QueuedInfo>() == std::mem::size_of::<libc::siginfo_t>());

fn queue_signal(tid: i32, sig: libc::c_int, value: usize) -> std::io::Result<()> {
    // SAFETY: getpid/getuid have no preconditions.
    let pid = unsafe { libc::getpid() };
    let info = QueuedInfo {
        signo: sig,
        errno: 0,
        code: SI_QUEUE,
        _pad: 0,
        pid,
        uid: unsafe { libc::getuid() },
        value,
        _rest: [0; 12],
    };
    // SAFETY: `info` is a complete siginfo_t.
    let r = unsafe { libc::syscall(libc::SYS_rt_tgsigqueueinfo, pid, tid, sig, &info as *const QueuedInfo) };
    if r < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Payload of a signal we queued ourselves, or `None` for a foreign one.
unsafe fn our_payload(info: *const libc::siginfo_t) -> Option<usize> {
    let q = &*(info as *const QueuedInfo);
    if q.code == SI_QUEUE && q.pid == libc::getpid() && q.value != 0 {
        Some(q.value)
    } else {
        None
    }
}

fn thread_alive(tid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    let r = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, 0) };
    !(r < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH))
}

fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let tsp = ts.as_ref().map_or(std::ptr::null(), |t| t as *const libc::timespec);
    // SAFETY: `word` is a live 32-bit atomic.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            tsp,
        );
    }
}

fn futex_wake(word: &AtomicU32) {
    // SAFETY: `word` is a live 32-bit atomic.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
        );
    }
}

static HANDLERS: Once = Once::new();

/// Install the suspend and capture handlers once per process.
pub fn install_handlers() {
    HANDLERS.call_once(|| {
        install(SUSPEND_SIGNAL, on_suspend as usize);
        install(CAPTURE_SIGNAL, on_capture as usize);
    });
}

fn install(sig: libc::c_int, handler: usize) {
    // SAFETY: a zeroed sigaction is valid; we fill every field we rely on.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

extern "C" fn on_suspend(_sig: libc::c_int, info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    // SAFETY: installed with SA_SIGINFO, so both pointers are valid.
    unsafe {
        let Some(ptr) = our_payload(info) else { return };
        let ctx = &*(ptr as *const ThreadContext);
        let park = &ctx.park;
        // A request the manager gave up on is still delivered once the
        // signal is unblocked; it must not park anyone.
        if park.lifecycle.load(Ordering::Acquire) != SIGNALED {
            return;
        }
        let errno = *libc::__errno_location();
        let uc = uc as *mut libc::ucontext_t;

        *park.record.get() = CpuRecord::from_ucontext(uc, clone::fs_base());
        let gen = park.release.load(Ordering::Acquire);
        if park
            .lifecycle
            .compare_exchange(SIGNALED, SUSPENDED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        futex_wake(&park.lifecycle);

        while park.release.load(Ordering::Acquire) == gen {
            futex_wait(&park.release, gen, None);
        }

        match park.action.load(Ordering::Acquire) {
            a if a == Resume::Restore as u32 => {
                let rec = *park.record.get();
                rec.write_ucontext(uc);
                clone::set_fs_base(rec.fs_base);
                park.lifecycle.store(RUNNING, Ordering::Release);
                futex_wake(&park.lifecycle);
                // errno belongs to the restored image now.
            }
            a if a == Resume::Exit as u32 => {
                park.lifecycle.store(EXITED, Ordering::Release);
                futex_wake(&park.lifecycle);
                // Our pthread struct is gone from the restored image; the
                // kernel must not clear a tid field there on exit.
                libc::syscall(libc::SYS_set_tid_address, 0usize);
                libc::syscall(libc::SYS_exit, 0);
            }
            _ => {
                park.lifecycle.store(RUNNING, Ordering::Release);
                futex_wake(&park.lifecycle);
                *libc::__errno_location() = errno;
            }
        }
    }
}

/// Work run inside the capture handler, with the presenting thread's
/// interrupted context.
struct CaptureJob<'a> {
    run: &'a mut dyn FnMut(*mut libc::ucontext_t),
}

extern "C" fn on_capture(_sig: libc::c_int, info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    // SAFETY: installed with SA_SIGINFO; the payload is the CaptureJob the
    // queueing thread keeps alive until the signal is handled.
    unsafe {
        let Some(ptr) = our_payload(info) else { return };
        let job = &mut *(ptr as *mut CaptureJob<'_>);
        (job.run)(uc as *mut libc::ucontext_t);
    }
}

/// Run `f` in a signal handler on the calling thread, handing it the
/// thread's interrupted context.  Returns once the handler has returned.
///
/// If `f` rewrites the context, this call does not return here at all:
/// execution continues wherever the new context points.
pub fn with_own_context(mut f: impl FnMut(*mut libc::ucontext_t)) -> std::io::Result<()> {
    install_handlers();
    let mut job = CaptureJob { run: &mut f };
    // Delivered before the syscall returns: the signal targets this thread.
    queue_signal(crate::thread_state::gettid(), CAPTURE_SIGNAL, &mut job as *mut CaptureJob<'_> as usize)
}

// ═══════════════════════════════════════════════════════════════════════
//  Manager-side suspension
// ═══════════════════════════════════════════════════════════════════════

/// Park every thread in `targets` except the caller, pushing the ones that
/// are now suspended onto `parked` (which must have room for all of them).
///
/// Threads found dead are marked exited and skipped.  On timeout the
/// requests still pending are withdrawn, every already parked thread is
/// released again and the stuck tid is returned.
pub(crate) fn suspend_all(
    targets: &[&'static ThreadContext],
    parked: &mut Vec<&'static ThreadContext>,
    timeout: Duration,
) -> Result<(), i32> {
    debug_assert!(parked.capacity() - parked.len() >= targets.len());
    install_handlers();

    let me = crate::thread_state::gettid();
    for ctx in targets {
        if ctx.park.is_exited() || ctx.tid() == me {
            continue;
        }
        ctx.park.lifecycle.store(SIGNALED, Ordering::Release);
        match queue_signal(ctx.tid(), SUSPEND_SIGNAL, *ctx as *const ThreadContext as usize) {
            Ok(()) => parked.push(ctx),
            Err(_) => ctx.park.mark_exited(),
        }
    }

    let deadline = Instant::now() + timeout;
    let mut i = 0;
    while i < parked.len() {
        let ctx = parked[i];
        if ctx.park.is_suspended() {
            i += 1;
            continue;
        }
        if !thread_alive(ctx.tid()) {
            ctx.park.mark_exited();
            parked.swap_remove(i);
            continue;
        }
        if Instant::now() >= deadline {
            let stuck = ctx.tid();
            withdraw_pending(parked);
            release_all(parked, |_| Resume::Continue);
            parked.clear();
            return Err(stuck);
        }
        futex_wait(&ctx.park.lifecycle, SIGNALED, Some(Duration::from_millis(10)));
    }
    Ok(())
}

/// Cancel the request of every thread in `parked` that has not reached its
/// handler yet, keeping only the ones that did.
fn withdraw_pending(parked: &mut Vec<&'static ThreadContext>) {
    parked.retain(|ctx| {
        ctx.park
            .lifecycle
            .compare_exchange(SIGNALED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    });
}

/// Release every parked thread with the action `decide` picks, then wait
/// until each one has left its handler.
pub(crate) fn release_all(parked: &[&'static ThreadContext], mut decide: impl FnMut(&ThreadContext) -> Resume) {
    for ctx in parked {
        let action = decide(ctx);
        ctx.park.action.store(action as u32, Ordering::Release);
        ctx.park.release.fetch_add(1, Ordering::AcqRel);
        futex_wake(&ctx.park.release);
    }
    for ctx in parked {
        while ctx.park.is_suspended() {
            futex_wait(&ctx.park.lifecycle, SUSPENDED, Some(Duration::from_millis(10)));
        }
    }
}
