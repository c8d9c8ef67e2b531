//! Save and load ordering.
//!
//! # Control flow across a restore
//!
//! With an engine that rewinds threads, a successful load never returns.
//! The presenting thread's stack is replaced by its contents at save time,
//! and execution resumes inside [`CheckpointManager::save`] right after
//! its capture point.  `save` then sees the session in the `Restored`
//! phase, finishes the restore, and reports [`SaveOutcome::Restored`].
//!
//! Everything both halves need therefore lives in the arena-resident
//! [`Session`], and the frames of `save` and `load` hold the same locks
//! across the capture point.  No owning value lives on the stack across it.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use log::{debug, info, warn};

use super::clone::{self, AltStack, CpuRecord};
use super::slots::SlotStore;
use super::threads::{self, Resume};
use super::{CheckpointEngine, CheckpointError, FrameState, ImageIdentity, MemoryImage, Slot, ThreadRecord};
use crate::alloc::ARENA;
use crate::barrier::QuiescentPoint;
use crate::thread_state::{gettid, ThreadContext, ThreadTable};

/// Default time a thread gets to reach its suspend handler.
pub const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The slot now holds the checkpoint.
    Saved,
    /// This call returned a second time because `slot` was loaded.  The
    /// caller must reinstate `state` and answer the load.
    Restored { slot: u32, state: FrameState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Saving,
    Restored { slot: u32 },
}

struct Session {
    phase: Phase,
    parked: Vec<&'static ThreadContext>,
    records: Vec<ThreadRecord>,
    presenter: CpuRecord,
    image: MemoryImage,
    loading: Option<Arc<Slot>>,
    /// Register records recreated threads start from.  The child reads its
    /// record after `clone` returns, so they stay put until the next load.
    respawn: Vec<CpuRecord>,
    error: Option<CheckpointError>,
}

type IdentityFn = Box<dyn Fn() -> ImageIdentity + Send + Sync>;

pub struct CheckpointManager {
    engine: Mutex<Box<dyn CheckpointEngine>>,
    slots: SlotStore,
    threads: &'static ThreadTable,
    identity: IdentityFn,
    suspend_timeout: Duration,
    tid_offset: usize,
    session: Mutex<Session>,
}

impl CheckpointManager {
    /// A manager over `engine` whose slots may hold `budget` bytes in
    /// total (0 = unlimited).
    pub fn new(engine: Box<dyn CheckpointEngine>, budget: usize, threads: &'static ThreadTable) -> Self {
        Self {
            engine: Mutex::new(engine),
            slots: SlotStore::new(budget),
            threads,
            identity: Box::new(ImageIdentity::current),
            suspend_timeout: DEFAULT_SUSPEND_TIMEOUT,
            tid_offset: clone::find_tid_offset(),
            session: Mutex::new(Session {
                phase: Phase::Idle,
                parked: Vec::new(),
                records: Vec::new(),
                presenter: CpuRecord::zeroed(),
                image: MemoryImage::default(),
                loading: None,
                respawn: Vec::new(),
                error: None,
            }),
        }
    }

    /// Replace the executable identity source.
    pub fn with_identity(mut self, f: impl Fn() -> ImageIdentity + Send + Sync + 'static) -> Self {
        self.identity = Box::new(f);
        self
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub fn slots(&self) -> &SlotStore {
        &self.slots
    }

    pub fn engine_name(&self) -> &'static str {
        lock(&self.engine).name()
    }

    fn begin(&self) -> Result<MutexGuard<'_, Session>, CheckpointError> {
        match self.session.try_lock() {
            Ok(s) => Ok(s),
            Err(TryLockError::Poisoned(e)) => Ok(e.into_inner()),
            Err(TryLockError::WouldBlock) => Err(CheckpointError::NotQuiescent),
        }
    }

    /// Park every tracked thread but the caller.
    ///
    /// The arena stays locked while signals are in flight, so no thread is
    /// parked while it holds the allocator.
    fn suspend(&self, session: &mut Session, table: &[&'static ThreadContext]) -> Result<(), CheckpointError> {
        session.parked.clear();
        session.parked.reserve(table.len());
        session.records.clear();
        session.records.reserve(table.len());
        let hold = ARENA.hold();
        let r = threads::suspend_all(table, &mut session.parked, self.suspend_timeout);
        drop(hold);
        r.map_err(|tid| CheckpointError::SuspendFailed { tid })
    }

    /// Write a checkpoint of the whole process into `slot`.
    pub fn save(&self, _at: &QuiescentPoint, slot: u32, frame: FrameState) -> Result<SaveOutcome, CheckpointError> {
        let mut session = self.begin()?;
        let mut engine = lock(&self.engine);
        self.slots.check_budget(slot, engine.estimate()?)?;
        let identity = (self.identity)();
        let me = self.threads.register_current();
        let table = self.threads.lock();

        self.suspend(&mut session, &table)?;
        {
            let Session { parked, records, .. } = &mut *session;
            for ctx in parked.iter() {
                let mut cpu = ctx.park.record();
                cpu.altstack = ctx.park.altstack();
                records.push(ThreadRecord {
                    tid: ctx.tid(),
                    cpu,
                    counters: ctx.counters(),
                });
            }
        }
        session.phase = Phase::Saving;
        session.error = None;
        let ticket = self.slots.begin_write(slot);

        let captured = {
            let sess: &mut Session = &mut session;
            let eng: &mut dyn CheckpointEngine = &mut **engine;
            threads::with_own_context(|uc| {
                // SAFETY: `uc` comes from the capture handler.
                sess.presenter = unsafe { CpuRecord::from_ucontext(uc, clone::fs_base()) };
                if let Err(e) = eng.save(&mut sess.image) {
                    sess.error = Some(e);
                }
            })
        };

        // A load of this checkpoint resumes here.
        if let Phase::Restored { slot: loaded } = session.phase {
            std::mem::forget(ticket);
            session.phase = Phase::Idle;
            let Some(data) = session.loading.take() else {
                crate::die("restored without a slot to finish from");
            };
            self.finish_restore(&mut session, &table, me, &data, true);
            drop(table);
            info!("loaded slot {} at frame {}", loaded, data.frame.clock.frame);
            return Ok(SaveOutcome::Restored {
                slot: loaded,
                state: data.frame,
            });
        }

        session.phase = Phase::Idle;
        threads::release_all(&session.parked, |_| Resume::Continue);
        session.parked.clear();
        drop(table);

        let failure = match captured {
            Err(e) => Some(CheckpointError::Io(e)),
            Ok(()) => session.error.take(),
        };
        if let Some(e) = failure {
            ticket.abort();
            session.image.areas.clear();
            warn!("save to slot {} failed: {}", slot, e);
            return Err(e);
        }

        let contents = Slot {
            identity,
            frame,
            presenter: ThreadRecord {
                tid: me.tid(),
                cpu: session.presenter,
                counters: me.counters(),
            },
            threads: std::mem::take(&mut session.records),
            image: std::mem::take(&mut session.image),
        };
        debug!(
            "slot {}: {} bytes of memory, {} secondary threads",
            slot,
            contents.image.bytes(),
            contents.threads.len()
        );
        ticket.commit(contents);
        Ok(SaveOutcome::Saved)
    }

    /// Put the process back to the checkpoint in `slot`.
    ///
    /// With an engine that rewinds threads this returns only on failure;
    /// success continues from the matching [`save`](Self::save).
    pub fn load(&self, _at: &QuiescentPoint, slot: u32) -> Result<FrameState, CheckpointError> {
        let mut session = self.begin()?;
        let mut engine = lock(&self.engine);
        let saved = self.slots.get(slot)?;
        let current = (self.identity)();
        if saved.identity != current {
            return Err(CheckpointError::IdentityMismatch {
                saved: saved.identity,
                current,
            });
        }
        let rewinding = engine.rewinds_threads();
        if rewinding {
            let tid = gettid();
            if saved.presenter.tid != tid {
                return Err(CheckpointError::PresenterMismatch {
                    saved: saved.presenter.tid,
                    current: tid,
                });
            }
            if !has_altstack() {
                return Err(CheckpointError::Engine("presenting thread has no alternate signal stack".into()));
            }
        }
        let me = self.threads.register_current();
        let table = self.threads.lock();

        self.suspend(&mut session, &table)?;
        session.respawn.clear();
        session.respawn.reserve(saved.threads.len());

        if !rewinding {
            if let Err(e) = engine.restore(&saved.image) {
                threads::release_all(&session.parked, |_| Resume::Continue);
                session.parked.clear();
                return Err(e);
            }
            self.finish_restore(&mut session, &table, me, &saved, false);
            drop(table);
            info!("loaded slot {} at frame {}", slot, saved.frame.clock.frame);
            return Ok(saved.frame);
        }

        session.phase = Phase::Restored { slot };
        session.loading = Some(saved);
        let (image, presenter) = match session.loading.as_deref() {
            Some(s) => (&s.image as *const MemoryImage, &s.presenter.cpu as *const CpuRecord),
            None => crate::die("loading slot vanished"),
        };
        let eng: *mut dyn CheckpointEngine = &mut **engine;
        // SAFETY: every pointer targets arena memory the restore leaves alone.
        let r = threads::with_own_context(move |uc| unsafe { restore_and_jump(eng, image, presenter, uc) });

        // Reached only when the capture signal could not be raised.
        session.phase = Phase::Idle;
        session.loading = None;
        threads::release_all(&session.parked, |_| Resume::Continue);
        session.parked.clear();
        r?;
        Err(CheckpointError::Engine("restore did not transfer control".into()))
    }

    /// Second half of a load: put every thread where the slot says.
    fn finish_restore(
        &self,
        session: &mut Session,
        table: &[&'static ThreadContext],
        me: &ThreadContext,
        slot: &Slot,
        rewinding: bool,
    ) {
        if !rewinding {
            threads::release_all(&session.parked, |_| Resume::Continue);
            session.parked.clear();
            return;
        }

        me.set_counters(slot.presenter.counters);
        for rec in &slot.threads {
            if session.parked.iter().any(|c| c.tid() == rec.tid) {
                continue;
            }
            let owner = table.iter().copied().find(|c| c.tid() == rec.tid);
            let mut cpu = rec.cpu;
            cpu.altstack = match owner {
                Some(ctx) => ctx.park.altstack(),
                None => AltStack { sp: 0, flags: 0, _pad: 0, size: 0 },
            };
            session.respawn.push(cpu);
            let Some(regs) = session.respawn.last() else { continue };
            let tid_slot = clone::tid_slot(cpu.fs_base, self.tid_offset);
            // SAFETY: the memory image the record refers to has just been
            // restored, and `regs` stays in `respawn` until the next load.
            match unsafe { clone::spawn_at(regs, true, Some(tid_slot)) } {
                Ok(tid) => {
                    if let Some(ctx) = owner {
                        ctx.rebind(tid);
                        ctx.set_counters(rec.counters);
                        ctx.park.mark_running();
                    }
                    debug!("recreated thread {} as {}", rec.tid, tid);
                }
                Err(e) => crate::die_with("cannot recreate thread, errno", e.raw_os_error().map(i64::from)),
            }
        }

        threads::release_all(&session.parked, |ctx| match slot.threads.iter().find(|r| r.tid == ctx.tid()) {
            Some(rec) => {
                ctx.park.set_record(&rec.cpu);
                ctx.set_counters(rec.counters);
                Resume::Restore
            }
            None => Resume::Exit,
        });
        session.parked.clear();
    }
}

/// Runs in the presenting thread's capture handler, on its alternate stack.
/// Takes everything by value: the stack the caller's closure lives on is
/// overwritten by the restore.
#[inline(never)]
unsafe fn restore_and_jump(
    engine: *mut dyn CheckpointEngine,
    image: *const MemoryImage,
    presenter: *const CpuRecord,
    uc: *mut libc::ucontext_t,
) {
    if (*engine).restore(&*image).is_err() {
        crate::die("restore failed after memory was modified");
    }
    (*presenter).write_ucontext(uc);
    clone::set_fs_base((*presenter).fs_base);
}

fn has_altstack() -> bool {
    // SAFETY: a zeroed stack_t is a valid out-parameter.
    let mut cur: libc::stack_t = unsafe { std::mem::zeroed() };
    let r = unsafe { libc::sigaltstack(std::ptr::null(), &mut cur) };
    r == 0 && cur.ss_flags & libc::SS_DISABLE == 0
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::RegionEngine;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Instant;

    fn table() -> &'static ThreadTable {
        Box::leak(Box::new(ThreadTable::new()))
    }

    fn tracked(len: usize) -> (RegionEngine, &'static mut [u8]) {
        let buf: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        let mut engine = RegionEngine::new();
        unsafe { engine.track(buf.as_mut_ptr(), buf.len()) };
        (engine, buf)
    }

    fn state(frame: u64) -> FrameState {
        let mut s = FrameState::default();
        s.clock.frame = frame;
        s.entropy.word_pos = frame as u128 * 16;
        s
    }

    #[test]
    fn save_then_load_round_trips() {
        let (engine, buf) = tracked(128);
        let mgr = CheckpointManager::new(Box::new(engine), 0, table());
        let at = QuiescentPoint::new(3);

        buf[..5].copy_from_slice(b"alpha");
        assert_eq!(mgr.save(&at, 1, state(3)).unwrap(), SaveOutcome::Saved);
        buf[..5].copy_from_slice(b"omega");

        let restored = mgr.load(&at, 1).unwrap();
        assert_eq!(restored, state(3));
        assert_eq!(&buf[..5], b"alpha");
        assert_eq!(mgr.engine_name(), "regions");
    }

    #[test]
    fn identity_mismatch_changes_nothing() {
        static EXE: AtomicU64 = AtomicU64::new(1);
        let (engine, buf) = tracked(16);
        let mgr = CheckpointManager::new(Box::new(engine), 0, table()).with_identity(|| ImageIdentity {
            exe: EXE.load(Ordering::Relaxed),
            generation: 0,
        });
        let at = QuiescentPoint::new(0);

        buf[0] = 1;
        mgr.save(&at, 2, state(0)).unwrap();
        buf[0] = 2;
        EXE.store(99, Ordering::Relaxed);
        match mgr.load(&at, 2) {
            Err(e @ CheckpointError::IdentityMismatch { .. }) => {
                assert_eq!(e.code(), lockstep_protocol::ErrorCode::IdentityMismatch)
            }
            other => panic!("expected identity mismatch, got {other:?}"),
        }
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn exhausted_storage_keeps_prior_slot() {
        let (engine, buf) = tracked(64);
        let mgr = CheckpointManager::new(Box::new(engine), 100, table());
        let at = QuiescentPoint::new(0);

        buf[0] = 7;
        mgr.save(&at, 1, state(1)).unwrap();
        assert!(matches!(
            mgr.save(&at, 2, state(2)),
            Err(CheckpointError::StorageExhausted { needed: 64, .. })
        ));
        assert!(!mgr.slots().contains(2));

        // Overwriting the same slot does not count its old contents.
        buf[0] = 8;
        mgr.save(&at, 1, state(5)).unwrap();
        buf[0] = 0;
        assert_eq!(mgr.load(&at, 1).unwrap().clock.frame, 5);
        assert_eq!(buf[0], 8);
    }

    #[test]
    fn unknown_slot_is_reported() {
        let (engine, _buf) = tracked(8);
        let mgr = CheckpointManager::new(Box::new(engine), 0, table());
        let err = mgr.load(&QuiescentPoint::new(0), 42).unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownSlot(42)));
        assert_eq!(err.code(), lockstep_protocol::ErrorCode::UnknownSlot);
    }

    #[test]
    fn overlapping_operations_are_refused() {
        let (engine, _buf) = tracked(8);
        let mgr = CheckpointManager::new(Box::new(engine), 0, table());
        let _busy = mgr.session.lock().unwrap();
        assert!(matches!(
            mgr.save(&QuiescentPoint::new(0), 1, state(0)),
            Err(CheckpointError::NotQuiescent)
        ));
    }

    #[test]
    fn secondary_threads_are_recorded_and_resumed() {
        let threads = table();
        let (engine, _buf) = tracked(8);
        let mgr = CheckpointManager::new(Box::new(engine), 0, threads);

        let counter: &'static AtomicU64 = Box::leak(Box::new(AtomicU64::new(0)));
        let stop: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let ctx = threads.register_current();
            ctx.enter_own_code();
            tx.send(()).unwrap();
            while !stop.load(Ordering::Relaxed) {
                counter.fetch_add(1, Ordering::Relaxed);
                std::hint::spin_loop();
            }
        });
        rx.recv().unwrap();

        mgr.save(&QuiescentPoint::new(0), 1, state(0)).unwrap();
        let slot = mgr.slots().get(1).unwrap();
        assert_eq!(slot.threads.len(), 1);
        assert_ne!(slot.threads[0].cpu.rip(), 0);
        assert_eq!(slot.threads[0].counters.own_code, 1);
        assert_eq!(slot.presenter.tid, gettid());

        let seen = counter.load(Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) == seen {
            assert!(Instant::now() < deadline, "worker stayed parked");
            std::thread::yield_now();
        }

        mgr.load(&QuiescentPoint::new(0), 1).unwrap();
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
    }
}
