//! Whole-process checkpoints.
//!
//! - [`manager`] — save/load protocol: quiescence, suspension, slot commit
//! - [`slots`] — the slot store and its crash-safe write tickets
//! - [`threads`] — signal-based suspension of secondary threads
//! - [`clone`] — raw thread recreation at a saved register state
//! - [`region`] — engine over explicitly tracked memory regions
//! - [`mappings`] — engine over every writable private mapping
//!
//! The engine that copies pages is a swappable collaborator
//! ([`CheckpointEngine`]); the manager owns ordering and slot semantics.

pub mod clone;
pub mod manager;
pub mod mappings;
pub mod region;
pub mod slots;
pub mod threads;

use std::hash::{Hash, Hasher};

use lockstep_protocol::{ErrorCode, InputVector};
use thiserror::Error;

use crate::alloc::AllocError;
use crate::clock::ClockState;
use crate::entropy::EntropyState;
use crate::thread_state::GuardCounters;

pub use self::clone::CpuRecord;
pub use self::manager::{CheckpointManager, SaveOutcome};
pub use self::mappings::MappingsEngine;
pub use self::region::RegionEngine;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("slot {0} holds no checkpoint")]
    UnknownSlot(u32),
    #[error("slot {0} was invalidated by an interrupted save")]
    SlotInvalid(u32),
    #[error("checkpoint identity {saved:?} does not match the running image {current:?}")]
    IdentityMismatch { saved: ImageIdentity, current: ImageIdentity },
    #[error("checkpoint needs {needed} bytes but only {available} remain")]
    StorageExhausted { needed: usize, available: usize },
    #[error("another checkpoint operation is in progress")]
    NotQuiescent,
    #[error("thread {tid} did not suspend")]
    SuspendFailed { tid: i32 },
    #[error("slot was saved from thread {saved}, not {current}")]
    PresenterMismatch { saved: i32, current: i32 },
    #[error("engine failure: {0}")]
    Engine(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

impl CheckpointError {
    /// Code reported to the controller.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownSlot(_) => ErrorCode::UnknownSlot,
            Self::SlotInvalid(_) => ErrorCode::SlotInvalid,
            Self::IdentityMismatch { .. } => ErrorCode::IdentityMismatch,
            Self::StorageExhausted { .. } | Self::Alloc(_) => ErrorCode::StorageExhausted,
            Self::NotQuiescent => ErrorCode::NotQuiescent,
            Self::SuspendFailed { .. } => ErrorCode::SuspendFailed,
            Self::PresenterMismatch { .. } => ErrorCode::PresenterMismatch,
            Self::Engine(_) | Self::Io(_) => ErrorCode::EngineFailure,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Slot contents
// ═══════════════════════════════════════════════════════════════════════

/// What the executable image looked like when a slot was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageIdentity {
    /// Hash of the executable file's device, inode, size and mtime.
    pub exe: u64,
    /// Dynamic-linker load generation (objects added and removed).
    pub generation: u64,
}

impl ImageIdentity {
    /// Identity of the running process.
    pub fn current() -> Self {
        Self {
            exe: exe_fingerprint(),
            generation: link_generation(),
        }
    }
}

fn exe_fingerprint() -> u64 {
    use std::os::unix::fs::MetadataExt;
    let mut h = std::collections::hash_map::DefaultHasher::new();
    match std::fs::metadata("/proc/self/exe") {
        Ok(m) => (m.dev(), m.ino(), m.size(), m.mtime(), m.mtime_nsec()).hash(&mut h),
        Err(_) => 0u8.hash(&mut h),
    }
    h.finish()
}

fn link_generation() -> u64 {
    unsafe extern "C" fn visit(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut libc::c_void) -> libc::c_int {
        let out = &mut *(data as *mut u64);
        *out = ((*info).dlpi_adds as u64) << 32 | ((*info).dlpi_subs as u64 & 0xFFFF_FFFF);
        // The counters are global; the first object is enough.
        1
    }
    let mut generation: u64 = 0;
    // SAFETY: the callback only writes through `data`, which outlives the call.
    unsafe { libc::dl_iterate_phdr(Some(visit), &mut generation as *mut u64 as *mut libc::c_void) };
    generation
}

/// Frame-barrier state that travels with a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameState {
    pub clock: ClockState,
    pub inputs: InputVector,
    pub entropy: EntropyState,
}

/// One thread as captured at save time.
#[derive(Debug, Clone, Copy)]
pub struct ThreadRecord {
    pub tid: i32,
    pub cpu: CpuRecord,
    pub counters: GuardCounters,
}

/// Memory captured by an engine.
#[derive(Debug, Default)]
pub struct MemoryImage {
    pub areas: Vec<SavedArea>,
}

impl MemoryImage {
    pub fn bytes(&self) -> usize {
        self.areas.iter().map(|a| a.bytes.len()).sum()
    }
}

#[derive(Debug)]
pub struct SavedArea {
    pub start: usize,
    pub len: usize,
    /// `PROT_*` bits to reinstate after the copy.
    pub prot: i32,
    pub heap: bool,
    pub bytes: Vec<u8>,
}

/// A complete checkpoint.
#[derive(Debug)]
pub struct Slot {
    pub identity: ImageIdentity,
    pub frame: FrameState,
    pub presenter: ThreadRecord,
    pub threads: Vec<ThreadRecord>,
    pub image: MemoryImage,
}

impl Slot {
    pub fn size(&self) -> usize {
        self.image.bytes() + self.threads.len() * std::mem::size_of::<ThreadRecord>()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine seam
// ═══════════════════════════════════════════════════════════════════════

/// Page-copy mechanism behind the manager.
///
/// `save` and `restore` run inside a signal handler on the presenting
/// thread's alternate stack, with every other tracked thread parked.
pub trait CheckpointEngine: Send {
    fn name(&self) -> &'static str;

    /// Bytes a save taken now would need.
    fn estimate(&self) -> Result<usize, CheckpointError>;

    fn save(&mut self, dest: &mut MemoryImage) -> Result<(), CheckpointError>;

    /// Write `src` back.  Engines that rewind threads cannot report a
    /// failure after memory was modified: the manager terminates the
    /// process instead.  Other engines must fail before writing anything.
    fn restore(&mut self, src: &MemoryImage) -> Result<(), CheckpointError>;

    /// Whether `restore` rewinds thread stacks, so that every thread must
    /// resume at its saved context instead of where it was parked.
    fn rewinds_threads(&self) -> bool;
}
