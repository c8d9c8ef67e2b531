//! `/proc/self/maps` parsing and interval arithmetic.
//!
//! Every function here is pure: the checkpoint engine reads the maps file
//! and hands the text in.
//!
//! # Which mappings are captured
//!
//! A mapping is captured when it is writable and private, and is not one
//! of the kernel-provided pages (`[vsyscall]`, `[vvar]`, `[vdso]`,
//! `[vectors]`), not empty, and not part of the runtime's own image.
//! Memory owned by the arena is cut out of whatever remains.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub private: bool,
}

impl Perms {
    /// `mmap`/`mprotect` protection bits.
    pub fn prot(&self) -> i32 {
        let mut p = 0;
        if self.read {
            p |= 0x1;
        }
        if self.write {
            p |= 0x2;
        }
        if self.exec {
            p |= 0x4;
        }
        p
    }
}

/// One line of the maps file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapArea {
    pub start: usize,
    pub end: usize,
    pub perms: Perms,
    pub offset: u64,
    pub inode: u64,
    pub path: String,
}

impl MapArea {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn is_heap(&self) -> bool {
        self.path == "[heap]"
    }

    pub fn is_kernel_page(&self) -> bool {
        matches!(self.path.as_str(), "[vsyscall]" | "[vvar]" | "[vvar_vclock]" | "[vdso]" | "[vectors]")
    }
}

/// Parse one maps line.  Returns `None` for malformed input.
///
/// ```text
/// 7f1c2a000000-7f1c2a021000 rw-p 00000000 00:00 0          [heap]
/// ```
pub fn parse_line(line: &str) -> Option<MapArea> {
    let mut fields = line.split_ascii_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let p = fields.next()?.as_bytes();
    if p.len() < 4 {
        return None;
    }
    let perms = Perms {
        read: p[0] == b'r',
        write: p[1] == b'w',
        exec: p[2] == b'x',
        private: p[3] == b'p',
    };
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let inode = fields.next()?.parse().ok()?;
    let path = fields.collect::<Vec<_>>().join(" ");
    Some(MapArea { start, end, perms, offset, inode, path })
}

/// Parse the whole maps file, skipping malformed lines.
pub fn parse_maps(text: &str) -> Vec<MapArea> {
    text.lines().filter_map(parse_line).collect()
}

/// Whether `area` holds state a checkpoint must capture.
pub fn is_checkpointable(area: &MapArea, own_image: Option<&str>) -> bool {
    if area.is_empty() || !area.perms.write || !area.perms.private || area.is_kernel_page() {
        return false;
    }
    match own_image {
        Some(own) if !own.is_empty() => area.path != own,
        _ => true,
    }
}

/// `range` with every interval of `excluded` removed.
///
/// `excluded` need not be sorted or disjoint.
pub fn subtract(range: Range<usize>, excluded: &[Range<usize>]) -> Vec<Range<usize>> {
    let mut cuts: Vec<Range<usize>> = excluded
        .iter()
        .filter(|e| e.start < range.end && e.end > range.start)
        .cloned()
        .collect();
    cuts.sort_by_key(|r| r.start);

    let mut out = Vec::new();
    let mut cursor = range.start;
    for cut in cuts {
        if cut.start > cursor {
            out.push(cursor..cut.start.min(range.end));
        }
        cursor = cursor.max(cut.end);
        if cursor >= range.end {
            break;
        }
    }
    if cursor < range.end {
        out.push(cursor..range.end);
    }
    out
}

/// Parts of `ranges` that no interval of `cover` touches.
pub fn uncovered(ranges: &[Range<usize>], cover: &[Range<usize>]) -> Vec<Range<usize>> {
    ranges.iter().flat_map(|r| subtract(r.clone(), cover)).collect()
}

/// Capturable ranges of a maps listing, with `excluded` cut out.
pub fn checkpoint_ranges(areas: &[MapArea], own_image: Option<&str>, excluded: &[Range<usize>]) -> Vec<(Range<usize>, usize)> {
    areas
        .iter()
        .enumerate()
        .filter(|(_, a)| is_checkpointable(a, own_image))
        .flat_map(|(i, a)| subtract(a.range(), excluded).into_iter().map(move |r| (r, i)))
        .collect()
}

/// Total size of [`checkpoint_ranges`].
pub fn checkpoint_bytes(areas: &[MapArea], own_image: Option<&str>, excluded: &[Range<usize>]) -> usize {
    checkpoint_ranges(areas, own_image, excluded)
        .iter()
        .map(|(r, _)| r.end - r.start)
        .sum()
}
