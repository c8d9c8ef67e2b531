//! Per-thread reentrancy state.
//!
//! Interception code classifies the current thread with three nested
//! counters:
//!
//! - **native**: calls pass straight through to the real implementation
//! - **own code**: the runtime itself is executing
//! - **no log**: log records from this thread are dropped
//!
//! Entering native mode raises all three counters; leaving native mode
//! lowers only the native counter.  Callers therefore release in exact
//! reverse order of acquisition, and an out-of-order release leaves the
//! thread elevated.  Shims depend on the enable-only cascade, so it is
//! kept as is.
//!
//! Contexts are allocated from the [`ARENA`](crate::alloc::ARENA) and never
//! freed: restored thread-local storage may still point at a context that
//! belonged to a thread which has since exited.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::alloc::ARENA;
use crate::checkpoint::threads::ParkState;

/// Table of every thread the runtime has seen.
pub static THREADS: ThreadTable = ThreadTable::new();

thread_local! {
    static CURRENT: Cell<Option<&'static ThreadContext>> = const { Cell::new(None) };
}

/// Kernel thread id of the caller.
pub fn gettid() -> i32 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Snapshot of the three counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardCounters {
    pub native: i32,
    pub own_code: i32,
    pub no_log: i32,
}

/// Modes a new thread starts in, taken from its creator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InheritedMode {
    pub native: bool,
    pub own_code: bool,
}

pub struct ThreadContext {
    tid: AtomicI32,
    native: AtomicI32,
    own_code: AtomicI32,
    no_log: AtomicI32,
    pub(crate) park: ParkState,
}

impl ThreadContext {
    pub(crate) fn new(tid: i32) -> Self {
        Self {
            tid: AtomicI32::new(tid),
            native: AtomicI32::new(0),
            own_code: AtomicI32::new(0),
            no_log: AtomicI32::new(0),
            park: ParkState::new(),
        }
    }

    pub fn tid(&self) -> i32 {
        self.tid.load(Ordering::Acquire)
    }

    /// Point the context at a recreated kernel thread.
    pub(crate) fn rebind(&self, tid: i32) {
        self.tid.store(tid, Ordering::Release);
    }

    pub fn enter_native(&self) {
        self.native.fetch_add(1, Ordering::Relaxed);
        self.own_code.fetch_add(1, Ordering::Relaxed);
        self.no_log.fetch_add(1, Ordering::Relaxed);
    }

    /// Lowers only the native counter.
    pub fn exit_native(&self) {
        decrement(&self.native, "native");
    }

    pub fn enter_own_code(&self) {
        self.own_code.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exit_own_code(&self) {
        decrement(&self.own_code, "own_code");
    }

    pub fn enter_no_log(&self) {
        self.no_log.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exit_no_log(&self) {
        decrement(&self.no_log, "no_log");
    }

    pub fn is_native(&self) -> bool {
        self.native.load(Ordering::Relaxed) > 0
    }

    pub fn is_own_code(&self) -> bool {
        self.own_code.load(Ordering::Relaxed) > 0
    }

    pub fn is_no_log(&self) -> bool {
        self.no_log.load(Ordering::Relaxed) > 0
    }

    pub fn counters(&self) -> GuardCounters {
        GuardCounters {
            native: self.native.load(Ordering::Relaxed),
            own_code: self.own_code.load(Ordering::Relaxed),
            no_log: self.no_log.load(Ordering::Relaxed),
        }
    }

    /// Reinstate counters recorded in a checkpoint.
    pub fn set_counters(&self, c: GuardCounters) {
        self.native.store(c.native, Ordering::Relaxed);
        self.own_code.store(c.own_code, Ordering::Relaxed);
        self.no_log.store(c.no_log, Ordering::Relaxed);
    }

    /// Mode a thread spawned from this one should start in.
    pub fn mode_for_child(&self) -> InheritedMode {
        InheritedMode {
            native: self.is_native(),
            own_code: self.is_own_code(),
        }
    }

    /// Enter the modes inherited from the creating thread.
    pub fn apply_inherited(&self, mode: InheritedMode) {
        if mode.native {
            self.enter_native();
        }
        if mode.own_code {
            self.enter_own_code();
        }
    }
}

fn decrement(counter: &AtomicI32, name: &str) {
    let prev = counter.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0, "reentrancy violation: {name} counter went negative");
}

/// Registry of thread contexts keyed by kernel tid.
pub struct ThreadTable {
    threads: Mutex<Vec<&'static ThreadContext>>,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Find or create the context for the calling thread.
    ///
    /// A new context gets an arena-backed alternate signal stack so that
    /// checkpoint suspension never runs on memory a restore overwrites.
    pub fn register_current(&self) -> &'static ThreadContext {
        let tid = gettid();
        let mut threads = self.lock();
        if let Some(ctx) = threads
            .iter()
            .copied()
            .find(|c| c.tid() == tid && !c.park.is_exited())
        {
            return ctx;
        }
        let ctx: &'static ThreadContext = match ARENA.leak(ThreadContext::new(tid)) {
            Ok(ctx) => ctx,
            Err(_) => crate::die("cannot allocate thread context"),
        };
        ctx.park.install_altstack();
        threads.push(ctx);
        ctx
    }

    /// Look up a context by tid without creating one.
    pub fn find(&self, tid: i32) -> Option<&'static ThreadContext> {
        self.lock().iter().copied().find(|c| c.tid() == tid && !c.park.is_exited())
    }

    /// Contexts of every thread not known to have exited.
    pub fn live(&self) -> Vec<&'static ThreadContext> {
        self.lock().iter().copied().filter(|c| !c.park.is_exited()).collect()
    }

    /// Number of contexts ever registered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hold the table while threads are suspended, so that no thread is
    /// parked halfway through registration.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<&'static ThreadContext>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Context of the calling thread, created on first use.
pub fn current() -> &'static ThreadContext {
    CURRENT.with(|cell| match cell.get() {
        Some(ctx) => ctx,
        None => {
            let ctx = THREADS.register_current();
            cell.set(Some(ctx));
            ctx
        }
    })
}

/// Context of the calling thread if it already has one.  Never allocates,
/// and returns `None` while thread-local storage is being torn down.
pub fn try_current() -> Option<&'static ThreadContext> {
    CURRENT.try_with(|cell| cell.get()).ok().flatten()
}

/// The calling thread is about to exit.  Its context stays allocated but
/// is no longer suspended or recorded by checkpoints.
pub fn exiting() {
    if let Some(ctx) = try_current() {
        ctx.park.mark_exited();
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Scoped guards
// ═══════════════════════════════════════════════════════════════════════

/// Native mode for the guard's lifetime.
///
/// Unlike a bare [`ThreadContext::exit_native`], dropping the guard also
/// releases the own-code and no-log levels its entry cascaded into, so
/// nested guards unwind back to the state they started from.
#[must_use = "the mode ends when the guard is dropped"]
pub struct NativeGuard {
    ctx: &'static ThreadContext,
    _not_send: PhantomData<*const ()>,
}

impl NativeGuard {
    pub fn new() -> Self {
        Self::on(current())
    }

    pub fn on(ctx: &'static ThreadContext) -> Self {
        ctx.enter_native();
        Self { ctx, _not_send: PhantomData }
    }
}

impl Drop for NativeGuard {
    fn drop(&mut self) {
        self.ctx.exit_native();
        self.ctx.exit_no_log();
        self.ctx.exit_own_code();
    }
}

/// Own-code mode for the guard's lifetime.
#[must_use = "the mode ends when the guard is dropped"]
pub struct OwnCodeGuard {
    ctx: &'static ThreadContext,
    _not_send: PhantomData<*const ()>,
}

impl OwnCodeGuard {
    pub fn new() -> Self {
        Self::on(current())
    }

    pub fn on(ctx: &'static ThreadContext) -> Self {
        ctx.enter_own_code();
        Self { ctx, _not_send: PhantomData }
    }
}

impl Drop for OwnCodeGuard {
    fn drop(&mut self) {
        self.ctx.exit_own_code();
    }
}

/// Log suppression for the guard's lifetime.
#[must_use = "the mode ends when the guard is dropped"]
pub struct NoLogGuard {
    ctx: &'static ThreadContext,
    _not_send: PhantomData<*const ()>,
}

impl NoLogGuard {
    pub fn new() -> Self {
        Self::on(current())
    }

    pub fn on(ctx: &'static ThreadContext) -> Self {
        ctx.enter_no_log();
        Self { ctx, _not_send: PhantomData }
    }
}

impl Drop for NoLogGuard {
    fn drop(&mut self) {
        self.ctx.exit_no_log();
    }
}

/// Run `f` with the real implementations underneath interception.
pub fn native<R>(f: impl FnOnce() -> R) -> R {
    let _g = NativeGuard::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> &'static ThreadContext {
        Box::leak(Box::new(ThreadContext::new(gettid())))
    }

    fn flags(ctx: &ThreadContext) -> (bool, bool, bool) {
        (ctx.is_native(), ctx.is_own_code(), ctx.is_no_log())
    }

    #[test]
    fn native_cascades_on_enter_only() {
        let ctx = fresh();
        ctx.enter_native();
        assert_eq!(flags(ctx), (true, true, true));
        ctx.exit_native();
        assert_eq!(flags(ctx), (false, true, true));
        assert_eq!(ctx.counters(), GuardCounters { native: 0, own_code: 1, no_log: 1 });
    }

    #[test]
    fn lifo_guards_restore_original_state() {
        let ctx = fresh();
        let before = ctx.counters();
        {
            let _own = OwnCodeGuard::on(ctx);
            {
                let _nolog = NoLogGuard::on(ctx);
                {
                    let _native = NativeGuard::on(ctx);
                    assert_eq!(flags(ctx), (true, true, true));
                }
                assert_eq!(flags(ctx), (false, true, true));
            }
            assert_eq!(flags(ctx), (false, true, false));
        }
        assert_eq!(ctx.counters(), before);
    }

    #[test]
    fn raw_native_exit_leaves_cascade_behind() {
        let ctx = fresh();
        ctx.enter_own_code();
        ctx.enter_native();
        ctx.exit_native();
        ctx.exit_own_code();
        // Own code and no log were raised by the native entry and stay up.
        assert_eq!(flags(ctx), (false, true, true));
    }

    #[test]
    fn unmatched_native_enable_stays_native() {
        let ctx = fresh();
        ctx.enter_native();
        for _ in 0..100 {
            let _own = OwnCodeGuard::on(ctx);
            let _nolog = NoLogGuard::on(ctx);
        }
        assert!(ctx.is_native());
    }

    #[test]
    fn guard_releases_on_early_return() {
        fn early(ctx: &'static ThreadContext, bail: bool) -> Option<()> {
            let _g = OwnCodeGuard::on(ctx);
            if bail {
                return None;
            }
            Some(())
        }
        let ctx = fresh();
        assert!(early(ctx, true).is_none());
        assert!(!ctx.is_own_code());
        assert!(early(ctx, false).is_some());
        assert!(!ctx.is_own_code());
    }

    #[test]
    fn guard_releases_on_unwind() {
        let ctx = fresh();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = NoLogGuard::on(ctx);
            panic!("boom");
        }));
        assert!(r.is_err());
        assert!(!ctx.is_no_log());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reentrancy violation")]
    fn negative_counter_asserts() {
        let ctx = fresh();
        ctx.exit_own_code();
    }

    #[test]
    fn inherited_mode_follows_creator() {
        let parent = fresh();
        parent.enter_native();
        let child = fresh();
        child.apply_inherited(parent.mode_for_child());
        assert_eq!(flags(child), (true, true, true));

        let quiet = fresh();
        let plain = fresh();
        plain.apply_inherited(quiet.mode_for_child());
        assert_eq!(flags(plain), (false, false, false));
    }

    #[test]
    fn current_is_per_thread() {
        let here = current() as *const ThreadContext as usize;
        assert_eq!(current() as *const ThreadContext as usize, here);
        assert_eq!(current().tid(), gettid());
        let there = std::thread::spawn(|| current() as *const ThreadContext as usize)
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn table_finds_registered_threads() {
        let table = ThreadTable::new();
        let ctx = table.register_current();
        assert!(std::ptr::eq(ctx, table.register_current()));
        assert!(table.find(gettid()).is_some());
        assert!(table.find(-1).is_none());
        assert_eq!(table.live().len(), 1);
    }

    #[test]
    fn native_helper_scopes_mode() {
        let before = current().counters();
        let inside = native(|| current().is_native());
        assert!(inside);
        assert_eq!(current().counters(), before);
    }
}
