//! Reentrancy-safe arena allocator.
//!
//! Every container the runtime owns lives in memory obtained straight from
//! `mmap`, never from the target's `malloc`: an interposed allocator entry
//! point would otherwise recurse into interception code before its guard
//! is raised.  The preload crate installs [`ARENA`] as Rust's global
//! allocator, so `Vec`/`Box`/`String` inside the runtime are arena-backed.
//!
//! # Layout
//!
//! ```text
//!  small (≤ 64 KiB)                      large (> 64 KiB)
//!  ┌────────────┬─────────────────────┐  ┌──────────┬──────────────────┐
//!  │ ChunkHdr   │ blocks, bump-carved │  │ LargeHdr │ user bytes       │
//!  └────────────┴─────────────────────┘  └──────────┴──────────────────┘
//!   1 MiB mapping, power-of-two classes   one mapping per block, header
//!   recycled through intrusive free       occupies the first page
//!   lists
//! ```
//!
//! The lock is a spin lock held only across one allocate/free call.  The
//! checkpoint manager can [`hold`](RawArena::hold) it while it suspends
//! threads so that no parked thread owns it.

use std::alloc::{GlobalAlloc, Layout};
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;

/// Process-wide arena used by every runtime component.
pub static ARENA: RawArena = RawArena::new();

pub const PAGE_SIZE: usize = 4096;

/// Size of each small-object chunk mapping.
pub const CHUNK_SIZE: usize = 1 << 20;

const MIN_CLASS_SHIFT: u32 = 4;
const MAX_CLASS_SHIFT: u32 = 16;
const NUM_CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Largest request served from size classes.
pub const MAX_SMALL: usize = 1 << MAX_CLASS_SHIFT;

const CHUNK_HEADER: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("allocator exhausted: {requested} bytes requested with {mapped} of {limit} bytes mapped")]
    Exhausted {
        requested: usize,
        mapped: usize,
        limit: usize,
    },
    #[error("mmap of {len} bytes failed (errno {errno})")]
    MapFailed { len: usize, errno: i32 },
    #[error("alignment {0} is not supported")]
    Alignment(usize),
}

/// One mapping owned by the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub len: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

struct FreeBlock {
    next: *mut FreeBlock,
}

#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    len: usize,
}

#[repr(C)]
struct LargeHeader {
    next: *mut LargeHeader,
    prev: *mut LargeHeader,
    map_len: usize,
}

struct ArenaState {
    free: [*mut FreeBlock; NUM_CLASSES],
    bump: usize,
    bump_end: usize,
    chunks: *mut ChunkHeader,
    large: *mut LargeHeader,
    region_count: usize,
    mapped: usize,
}

/// Spin-locked mmap arena.  See the module docs.
pub struct RawArena {
    lock: AtomicBool,
    limit: AtomicUsize,
    state: UnsafeCell<ArenaState>,
}

// SAFETY: all access to `state` happens with `lock` held.
unsafe impl Sync for RawArena {}
unsafe impl Send for RawArena {}

/// Keeps the arena lock held until dropped.
///
/// The holding thread must not allocate through the arena while the guard
/// is alive.
pub struct ArenaHold<'a> {
    arena: &'a RawArena,
}

impl Drop for ArenaHold<'_> {
    fn drop(&mut self) {
        self.arena.unlock();
    }
}

impl RawArena {
    pub const fn new() -> Self {
        Self {
            lock: AtomicBool::new(false),
            limit: AtomicUsize::new(0),
            state: UnsafeCell::new(ArenaState {
                free: [ptr::null_mut(); NUM_CLASSES],
                bump: 0,
                bump_end: 0,
                chunks: ptr::null_mut(),
                large: ptr::null_mut(),
                region_count: 0,
                mapped: 0,
            }),
        }
    }

    /// Cap the total bytes the arena may map.  Zero means unlimited.
    pub fn set_limit(&self, bytes: usize) {
        self.limit.store(bytes, Ordering::Relaxed);
    }

    /// Total bytes currently mapped.
    pub fn mapped_bytes(&self) -> usize {
        self.lock();
        // SAFETY: lock held.
        let n = unsafe { (*self.state.get()).mapped };
        self.unlock();
        n
    }

    /// Hold the lock until the returned guard drops.
    pub fn hold(&self) -> ArenaHold<'_> {
        self.lock();
        ArenaHold { arena: self }
    }

    fn lock(&self) {
        let mut spins = 0u32;
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                // SAFETY: sched_yield has no preconditions.
                unsafe { libc::sched_yield() };
            }
        }
    }

    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Allocate a block for `layout`.
    pub fn try_allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.lock();
        // SAFETY: lock held for the whole call.
        let result = unsafe { self.allocate_locked(layout) };
        self.unlock();
        result
    }

    /// Return a block obtained from [`try_allocate`](Self::try_allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from this arena with the same `layout`.
    pub unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.lock();
        self.release_locked(ptr.as_ptr(), layout);
        self.unlock();
    }

    /// Move `value` into the arena and leak it.
    pub fn leak<T>(&self, value: T) -> Result<&'static mut T, AllocError> {
        let layout = Layout::new::<T>();
        let ptr = if layout.size() == 0 {
            NonNull::<T>::dangling()
        } else {
            self.try_allocate(layout)?.cast::<T>()
        };
        // SAFETY: fresh, properly aligned, never freed.
        unsafe {
            ptr.as_ptr().write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    /// Leak a zeroed byte buffer of `len` bytes.
    pub fn leak_zeroed(&self, len: usize, align: usize) -> Result<&'static mut [u8], AllocError> {
        let layout = Layout::from_size_align(len.max(1), align).map_err(|_| AllocError::Alignment(align))?;
        let ptr = self.try_allocate(layout)?;
        // SAFETY: `len` bytes were just allocated.
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, len);
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), len))
        }
    }

    /// Append every mapping owned by the arena to `out`.
    ///
    /// Reserves outside the lock so that this works when the arena is also
    /// the global allocator.
    pub fn regions_into(&self, out: &mut Vec<Region>) {
        loop {
            self.lock();
            // SAFETY: lock held.
            let needed = unsafe { (*self.state.get()).region_count };
            if out.capacity() - out.len() >= needed {
                // SAFETY: lock held; `out` has room so push never allocates.
                unsafe {
                    let st = &*self.state.get();
                    let mut c = st.chunks;
                    while !c.is_null() {
                        out.push(Region { start: c as usize, len: (*c).len });
                        c = (*c).next;
                    }
                    let mut l = st.large;
                    while !l.is_null() {
                        out.push(Region { start: l as usize, len: (*l).map_len });
                        l = (*l).next;
                    }
                }
                self.unlock();
                return;
            }
            self.unlock();
            out.reserve(needed + 4);
        }
    }

    pub fn regions(&self) -> Vec<Region> {
        let mut out = Vec::new();
        self.regions_into(&mut out);
        out
    }

    /// Whether `addr` falls inside memory owned by the arena.
    pub fn contains(&self, addr: usize) -> bool {
        self.lock();
        let mut found = false;
        // SAFETY: lock held.
        unsafe {
            let st = &*self.state.get();
            let mut c = st.chunks;
            while !c.is_null() && !found {
                found = addr >= c as usize && addr < c as usize + (*c).len;
                c = (*c).next;
            }
            let mut l = st.large;
            while !l.is_null() && !found {
                found = addr >= l as usize && addr < l as usize + (*l).map_len;
                l = (*l).next;
            }
        }
        self.unlock();
        found
    }

    unsafe fn allocate_locked(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let st = &mut *self.state.get();
        match size_class(layout) {
            Some(class) => {
                let head = st.free[class];
                if !head.is_null() {
                    st.free[class] = (*head).next;
                    return Ok(NonNull::new_unchecked(head as *mut u8));
                }
                let size = 1usize << (class as u32 + MIN_CLASS_SHIFT);
                let mut start = align_up(st.bump, size);
                if st.bump == 0 || start + size > st.bump_end {
                    self.map_chunk(st)?;
                    start = align_up(st.bump, size);
                }
                st.bump = start + size;
                Ok(NonNull::new_unchecked(start as *mut u8))
            }
            None => {
                if layout.align() > PAGE_SIZE {
                    return Err(AllocError::Alignment(layout.align()));
                }
                let map_len = align_up(layout.size(), PAGE_SIZE) + PAGE_SIZE;
                let base = self.map(st, map_len)? as *mut LargeHeader;
                base.write(LargeHeader {
                    next: st.large,
                    prev: ptr::null_mut(),
                    map_len,
                });
                if !st.large.is_null() {
                    (*st.large).prev = base;
                }
                st.large = base;
                st.region_count += 1;
                Ok(NonNull::new_unchecked((base as *mut u8).add(PAGE_SIZE)))
            }
        }
    }

    unsafe fn release_locked(&self, ptr: *mut u8, layout: Layout) {
        let st = &mut *self.state.get();
        match size_class(layout) {
            Some(class) => {
                let block = ptr as *mut FreeBlock;
                (*block).next = st.free[class];
                st.free[class] = block;
            }
            None => {
                let hdr = ptr.sub(PAGE_SIZE) as *mut LargeHeader;
                let LargeHeader { next, prev, map_len } = hdr.read();
                if prev.is_null() {
                    st.large = next;
                } else {
                    (*prev).next = next;
                }
                if !next.is_null() {
                    (*next).prev = prev;
                }
                st.region_count -= 1;
                st.mapped -= map_len;
                sys::unmap(hdr as *mut u8, map_len);
            }
        }
    }

    unsafe fn map_chunk(&self, st: &mut ArenaState) -> Result<(), AllocError> {
        let base = self.map(st, CHUNK_SIZE)? as *mut ChunkHeader;
        base.write(ChunkHeader {
            next: st.chunks,
            len: CHUNK_SIZE,
        });
        st.chunks = base;
        st.region_count += 1;
        st.bump = base as usize + CHUNK_HEADER;
        st.bump_end = base as usize + CHUNK_SIZE;
        Ok(())
    }

    unsafe fn map(&self, st: &mut ArenaState, len: usize) -> Result<*mut u8, AllocError> {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit != 0 && st.mapped + len > limit {
            return Err(AllocError::Exhausted {
                requested: len,
                mapped: st.mapped,
                limit,
            });
        }
        let p = sys::map_anonymous(len);
        if p.is_null() {
            return Err(AllocError::MapFailed {
                len,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        st.mapped += len;
        Ok(p)
    }
}

impl Default for RawArena {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for RawArena {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.try_allocate(layout) {
            Ok(p) => p.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(p) = NonNull::new(ptr) {
            self.release(p, layout);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = self.alloc(layout);
        // Fresh mappings are zero already, but recycled blocks are not.
        if !p.is_null() {
            ptr::write_bytes(p, 0, layout.size());
        }
        p
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        if let (Some(a), Some(b)) = (size_class(layout), size_class(new_layout)) {
            if a == b {
                return ptr;
            }
        }
        let new = self.alloc(new_layout);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new
    }
}

/// Size class index for `layout`, or `None` for the large path.
fn size_class(layout: Layout) -> Option<usize> {
    let need = layout.size().max(layout.align()).max(1 << MIN_CLASS_SHIFT);
    if need > MAX_SMALL {
        return None;
    }
    let shift = need.next_power_of_two().trailing_zeros();
    Some((shift - MIN_CLASS_SHIFT) as usize)
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

mod sys {
    pub(super) fn map_anonymous(len: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping with no address hint.
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            std::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    pub(super) unsafe fn unmap(p: *mut u8, len: usize) {
        libc::munmap(p as *mut libc::c_void, len);
    }
}
