//! Engine over explicitly registered memory regions.
//!
//! Only the tracked ranges are copied, and thread stacks are left alone:
//! parked threads simply carry on from where they were suspended.  This is
//! the engine for embedders that know where their state lives, and the one
//! the manager's own tests run against.

use super::{CheckpointEngine, CheckpointError, MemoryImage, SavedArea};
use crate::alloc::Region;

#[derive(Debug, Default)]
pub struct RegionEngine {
    regions: Vec<Region>,
}

impl RegionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `len` bytes at `ptr` to every future checkpoint.
    ///
    /// # Safety
    ///
    /// The range must stay mapped and writable for as long as the engine
    /// is used, and must not overlap another tracked range.
    pub unsafe fn track(&mut self, ptr: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        self.regions.push(Region {
            start: ptr as usize,
            len,
        });
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }
}

impl CheckpointEngine for RegionEngine {
    fn name(&self) -> &'static str {
        "regions"
    }

    fn estimate(&self) -> Result<usize, CheckpointError> {
        Ok(self.regions.iter().map(|r| r.len).sum())
    }

    fn save(&mut self, dest: &mut MemoryImage) -> Result<(), CheckpointError> {
        dest.areas.clear();
        dest.areas.reserve(self.regions.len());
        for r in &self.regions {
            let mut bytes = Vec::with_capacity(r.len);
            // SAFETY: `track` guarantees the range is mapped.
            unsafe {
                std::ptr::copy_nonoverlapping(r.start as *const u8, bytes.as_mut_ptr(), r.len);
                bytes.set_len(r.len);
            }
            dest.areas.push(SavedArea {
                start: r.start,
                len: r.len,
                prot: libc::PROT_READ | libc::PROT_WRITE,
                heap: false,
                bytes,
            });
        }
        Ok(())
    }

    fn restore(&mut self, src: &MemoryImage) -> Result<(), CheckpointError> {
        for area in &src.areas {
            if !self.regions.iter().any(|r| r.start == area.start && r.len == area.len) {
                return Err(CheckpointError::Engine(format!(
                    "region {:#x}+{:#x} is no longer tracked",
                    area.start, area.len
                )));
            }
        }
        for area in &src.areas {
            // SAFETY: checked above that the range is still tracked.
            unsafe { std::ptr::copy_nonoverlapping(area.bytes.as_ptr(), area.start as *mut u8, area.len) };
        }
        Ok(())
    }

    fn rewinds_threads(&self) -> bool {
        false
    }
}
