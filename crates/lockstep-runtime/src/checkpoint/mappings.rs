//! Engine over every writable private mapping of the process.
//!
//! The capture set is read from `/proc/self/maps` at save time: private
//! writable areas, minus kernel-provided pages, the runtime's own image,
//! its static bookkeeping, and every region the arena owns.  Restore reshapes the address space to
//! the saved layout (unmapping areas that appeared since, moving the
//! program break, recreating areas that vanished) before copying the bytes
//! back.  Thread stacks are included, so parked threads must resume at
//! their saved contexts afterwards.

use std::io::Read;
use std::ops::Range;

use super::{CheckpointEngine, CheckpointError, MemoryImage, SavedArea};
use crate::alloc::{Region, ARENA, PAGE_SIZE};
use crate::thread_state::THREADS;
use crate::verified::maps::{self, MapArea};

/// Capacity reserved for reading the maps file, so that reading it never
/// moves the buffer while the listing is being generated.
const MAPS_BUFFER: usize = 1 << 20;

pub struct MappingsEngine {
    own_image: Option<String>,
    scratch: Vec<u8>,
    arena: Vec<Region>,
}

impl MappingsEngine {
    pub fn new() -> Self {
        Self {
            own_image: own_image_path(),
            scratch: Vec::with_capacity(MAPS_BUFFER),
            arena: Vec::new(),
        }
    }

    /// Path of the shared object this engine lives in, when it is not the
    /// main executable.
    pub fn own_image(&self) -> Option<&str> {
        self.own_image.as_deref()
    }

    fn read_maps(&mut self) -> Result<Vec<MapArea>, CheckpointError> {
        self.scratch.clear();
        std::fs::File::open("/proc/self/maps")?.read_to_end(&mut self.scratch)?;
        let text = String::from_utf8_lossy(&self.scratch);
        Ok(maps::parse_maps(&text))
    }

    /// Everything that must never be captured or overwritten.
    fn excluded(&mut self) -> Vec<Range<usize>> {
        self.arena.clear();
        ARENA.regions_into(&mut self.arena);
        let mut out: Vec<Range<usize>> = self.arena.iter().map(|r| r.start..r.end()).collect();
        let scratch = self.scratch.as_ptr() as usize;
        out.push(scratch..scratch + self.scratch.capacity());
        out.extend(runtime_statics());
        out
    }

    /// The capture set as `(range, area)` pairs.
    pub fn selection(&mut self) -> Result<Vec<(Range<usize>, MapArea)>, CheckpointError> {
        let areas = self.read_maps()?;
        let excluded = self.excluded();
        let own = self.own_image.clone();
        Ok(maps::checkpoint_ranges(&areas, own.as_deref(), &excluded)
            .into_iter()
            .map(|(r, i)| (r, areas[i].clone()))
            .collect())
    }
}

impl Default for MappingsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointEngine for MappingsEngine {
    fn name(&self) -> &'static str {
        "mappings"
    }

    /// Slots already held live in the arena, so it is left out here as it
    /// is from the capture set.
    fn estimate(&self) -> Result<usize, CheckpointError> {
        let text = std::fs::read_to_string("/proc/self/maps")?;
        let areas = maps::parse_maps(&text);
        let mut excluded: Vec<Range<usize>> = ARENA.regions().iter().map(|r| r.start..r.end()).collect();
        excluded.extend(runtime_statics());
        Ok(maps::checkpoint_bytes(&areas, self.own_image.as_deref(), &excluded))
    }

    fn save(&mut self, dest: &mut MemoryImage) -> Result<(), CheckpointError> {
        let selection = self.selection()?;
        dest.areas.clear();
        dest.areas.reserve(selection.len());
        for (range, area) in selection {
            let len = range.end - range.start;
            let prot = area.perms.prot();
            if !area.perms.read {
                protect_span(range.start, len, prot | libc::PROT_READ)?;
            }
            let mut bytes = Vec::with_capacity(len);
            // SAFETY: the range is mapped and readable.
            unsafe {
                std::ptr::copy_nonoverlapping(range.start as *const u8, bytes.as_mut_ptr(), len);
                bytes.set_len(len);
            }
            if !area.perms.read {
                protect_span(range.start, len, prot)?;
            }
            dest.areas.push(SavedArea {
                start: range.start,
                len,
                prot,
                heap: area.is_heap(),
                bytes,
            });
        }
        Ok(())
    }

    fn restore(&mut self, src: &MemoryImage) -> Result<(), CheckpointError> {
        let heap_end = src.areas.iter().filter(|a| a.heap).map(|a| a.start + a.len).max();
        if let Some(end) = heap_end {
            set_break(end)?;
        }

        let saved: Vec<Range<usize>> = src.areas.iter().map(|a| a.start..a.start + a.len).collect();
        let current: Vec<Range<usize>> = self
            .selection()?
            .into_iter()
            .filter(|(_, area)| !area.is_heap())
            .map(|(r, _)| r)
            .collect();
        for stale in maps::uncovered(&current, &saved) {
            // SAFETY: the range holds program memory that did not exist at
            // save time; arena regions were cut out of `current`.
            if unsafe { libc::munmap(stale.start as *mut libc::c_void, stale.end - stale.start) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        for area in &src.areas {
            let rw = libc::PROT_READ | libc::PROT_WRITE;
            if protect_span(area.start, area.len, rw).is_err() {
                let (start, len) = page_span(area.start, area.len);
                map_fixed(start, len)?;
            }
            // SAFETY: the range is now mapped read-write.
            unsafe { std::ptr::copy_nonoverlapping(area.bytes.as_ptr(), area.start as *mut u8, area.len) };
            protect_span(area.start, area.len, area.prot)?;
        }
        Ok(())
    }

    fn rewinds_threads(&self) -> bool {
        true
    }
}

/// Runtime bookkeeping kept in static memory.  When the runtime is its own
/// shared object these lie in the excluded image anyway; when it is linked
/// into the executable they sit next to program data and are cut out here.
fn runtime_statics() -> [Range<usize>; 2] {
    [object_range(&ARENA), object_range(&THREADS)]
}

fn object_range<T>(v: &T) -> Range<usize> {
    let start = v as *const T as usize;
    start..start + std::mem::size_of::<T>()
}

/// The whole pages covering `start..start + len`.  Exclusions may cut a
/// range inside a page, and `mprotect`/`mmap` work on pages only.
fn page_span(start: usize, len: usize) -> (usize, usize) {
    let first = start & !(PAGE_SIZE - 1);
    let end = (start + len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    (first, end - first)
}

/// Change the protection of the pages under a range.  Every captured area
/// is writable, so the pages it shares with an excluded neighbour carry
/// the same protection already.
fn protect_span(start: usize, len: usize, prot: i32) -> Result<(), CheckpointError> {
    let (start, len) = page_span(start, len);
    protect(start, len, prot)
}

fn protect(start: usize, len: usize, prot: i32) -> Result<(), CheckpointError> {
    // SAFETY: mprotect on a range we parsed from the maps file.
    if unsafe { libc::mprotect(start as *mut libc::c_void, len, prot) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn map_fixed(start: usize, len: usize) -> Result<(), CheckpointError> {
    // SAFETY: the range is not mapped (mprotect just failed on it) and is
    // disjoint from the arena.
    let p = unsafe {
        libc::mmap(
            start as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn set_break(end: usize) -> Result<(), CheckpointError> {
    let end = (end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    // SAFETY: brk(0) only queries; a non-zero brk moves the program break,
    // whose contents are rewritten right after.
    let current = unsafe { libc::syscall(libc::SYS_brk, 0usize) } as usize;
    if current == end {
        return Ok(());
    }
    let moved = unsafe { libc::syscall(libc::SYS_brk, end) } as usize;
    if moved != end {
        return Err(CheckpointError::Engine(format!(
            "cannot move program break from {current:#x} to {end:#x}"
        )));
    }
    Ok(())
}

fn own_image_path() -> Option<String> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let here = own_image_path as *const libc::c_void;
    // SAFETY: `here` is an address inside this object.
    if unsafe { libc::dladdr(here, &mut info) } == 0 || info.dli_fname.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned();
    let exe = std::fs::read_link("/proc/self/exe").ok();
    let canonical = std::fs::canonicalize(&name).ok();
    match (canonical, exe) {
        (Some(c), Some(e)) if c == e => None,
        (None, _) => None,
        (Some(c), _) => Some(c.to_string_lossy().into_owned()),
    }
}
