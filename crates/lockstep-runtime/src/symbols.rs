//! Resolution of the real implementations behind intercepted symbols.
//!
//! Every `(name, version, namespace)` key is looked up exactly once for the
//! life of the process; the answer, including "not found", is cached.  A
//! failed lookup disables the feature area that asked for it, and the rest
//! of the runtime carries on without that area.
//!
//! Global lookups must never return our own interposed definitions, or the
//! shim would call itself.  A global hit that lives in this image is
//! retried with `RTLD_NEXT`, which searches only objects loaded after us.

use std::collections::BTreeMap;
use std::ffi::{c_void, CString};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use thiserror::Error;

use crate::thread_state;

/// Address of a resolved symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolAddr(usize);

impl SymbolAddr {
    pub fn new(addr: usize) -> Option<Self> {
        (addr != 0).then_some(Self(addr))
    }

    pub fn addr(&self) -> usize {
        self.0
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.0 as *const c_void
    }
}

/// An opened library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LibraryHandle(pub usize);

/// Where a lookup searches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// Every loaded object except this one.
    Global,
    /// Global first; if that fails, the named library, opened on demand.
    GlobalOr(String),
    /// Only the given library.
    Handle(LibraryHandle),
}

/// Subsystems that can be disabled independently when their symbols are
/// missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FeatureArea {
    Audio = 0,
    Video = 1,
    Input = 2,
    Time = 3,
    Threading = 4,
    Other = 5,
}

impl FeatureArea {
    pub const ALL: [FeatureArea; 6] = [
        Self::Audio,
        Self::Video,
        Self::Input,
        Self::Time,
        Self::Threading,
        Self::Other,
    ];

    /// Area numbered `n` across the C boundary.
    pub fn from_index(n: u32) -> Option<Self> {
        Self::ALL.get(n as usize).copied()
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for FeatureArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Input => "input",
            Self::Time => "time",
            Self::Threading => "threading",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("symbol {name} not found")]
    NotFound { name: String },
    #[error("symbol name {0:?} contains a NUL byte")]
    InvalidName(String),
}

/// The platform step under the resolver.
pub trait SymbolLookup: Send + Sync {
    /// Search every loaded object in load order.
    fn global(&self, name: &str, version: Option<&str>) -> Option<SymbolAddr>;

    /// Search the objects loaded after this one.
    fn next(&self, name: &str, version: Option<&str>) -> Option<SymbolAddr>;

    /// Whether `addr` lies inside this runtime's own image.
    fn is_own(&self, addr: SymbolAddr) -> bool;

    fn open(&self, library: &str) -> Option<LibraryHandle>;

    fn in_handle(&self, handle: LibraryHandle, name: &str) -> Option<SymbolAddr>;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SymbolKey {
    name: String,
    version: Option<String>,
    namespace: Namespace,
}

pub struct SymbolResolver<L: SymbolLookup = DlLookup> {
    lookup: L,
    cache: Mutex<BTreeMap<SymbolKey, Result<SymbolAddr, ResolutionError>>>,
    disabled: AtomicU8,
}

impl<L: SymbolLookup> SymbolResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self {
            lookup,
            cache: Mutex::new(BTreeMap::new()),
            disabled: AtomicU8::new(0),
        }
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    fn cache(&self) -> MutexGuard<'_, BTreeMap<SymbolKey, Result<SymbolAddr, ResolutionError>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn resolve(&self, name: &str, namespace: &Namespace) -> Result<SymbolAddr, ResolutionError> {
        self.resolve_versioned(name, None, namespace)
    }

    /// Resolve a specific symbol version (`dlvsym`).
    pub fn resolve_versioned(
        &self,
        name: &str,
        version: Option<&str>,
        namespace: &Namespace,
    ) -> Result<SymbolAddr, ResolutionError> {
        let key = SymbolKey {
            name: name.to_owned(),
            version: version.map(str::to_owned),
            namespace: namespace.clone(),
        };
        // The lock is held across the lookup so that racing threads wait for
        // the first answer instead of repeating it.
        let mut cache = self.cache();
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }
        let result = thread_state::native(|| self.search(name, version, namespace));
        match &result {
            Ok(addr) => debug!("resolved {} at {:#x}", name, addr.addr()),
            Err(e) => debug!("{}", e),
        }
        cache.insert(key, result.clone());
        result
    }

    /// Resolve on behalf of `area`, disabling it on failure.
    pub fn resolve_for(&self, area: FeatureArea, name: &str, namespace: &Namespace) -> Result<SymbolAddr, ResolutionError> {
        let result = self.resolve(name, namespace);
        if let Err(e) = &result {
            let prev = self.disabled.fetch_or(area.bit(), Ordering::AcqRel);
            if prev & area.bit() == 0 {
                warn!("{} support disabled: {}", area, e);
            }
        }
        result
    }

    pub fn is_enabled(&self, area: FeatureArea) -> bool {
        self.disabled.load(Ordering::Acquire) & area.bit() == 0
    }

    pub fn disabled_areas(&self) -> Vec<FeatureArea> {
        FeatureArea::ALL.into_iter().filter(|a| !self.is_enabled(*a)).collect()
    }

    /// Number of distinct keys resolved so far.
    pub fn cached(&self) -> usize {
        self.cache().len()
    }

    fn search(&self, name: &str, version: Option<&str>, namespace: &Namespace) -> Result<SymbolAddr, ResolutionError> {
        if name.contains('\0') {
            return Err(ResolutionError::InvalidName(name.to_owned()));
        }
        let found = match namespace {
            Namespace::Handle(h) => self.lookup.in_handle(*h, name),
            Namespace::Global => self.global(name, version),
            Namespace::GlobalOr(library) => self.global(name, version).or_else(|| {
                let handle = self.lookup.open(library)?;
                self.lookup.in_handle(handle, name)
            }),
        };
        found.ok_or_else(|| ResolutionError::NotFound { name: name.to_owned() })
    }

    fn global(&self, name: &str, version: Option<&str>) -> Option<SymbolAddr> {
        let hit = self.lookup.global(name, version)?;
        if !self.lookup.is_own(hit) {
            return Some(hit);
        }
        debug!("{} resolves to our own image, trying the next object", name);
        self.lookup.next(name, version)
    }
}

impl Default for SymbolResolver<DlLookup> {
    fn default() -> Self {
        Self::new(DlLookup::new())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Dynamic linker
// ═══════════════════════════════════════════════════════════════════════

/// Lookup through `dlsym`, `dlvsym`, `dladdr` and `dlopen`.
#[derive(Debug)]
pub struct DlLookup {
    own_base: usize,
}

impl DlLookup {
    pub fn new() -> Self {
        Self {
            own_base: object_base(DlLookup::new as *const c_void).unwrap_or(0),
        }
    }
}

impl Default for DlLookup {
    fn default() -> Self {
        Self::new()
    }
}

fn object_base(addr: *const c_void) -> Option<usize> {
    // SAFETY: a zeroed Dl_info is a valid out-parameter.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(addr, &mut info) } == 0 {
        return None;
    }
    Some(info.dli_fbase as usize)
}

fn dl_symbol(handle: *mut c_void, name: &str, version: Option<&str>) -> Option<SymbolAddr> {
    let cname = CString::new(name).ok()?;
    // SAFETY: both strings are NUL-terminated and outlive the call.
    let p = match version {
        Some(v) => {
            let cver = CString::new(v).ok()?;
            unsafe { libc::dlvsym(handle, cname.as_ptr(), cver.as_ptr()) }
        }
        None => unsafe { libc::dlsym(handle, cname.as_ptr()) },
    };
    SymbolAddr::new(p as usize)
}

impl SymbolLookup for DlLookup {
    fn global(&self, name: &str, version: Option<&str>) -> Option<SymbolAddr> {
        dl_symbol(libc::RTLD_DEFAULT, name, version)
    }

    fn next(&self, name: &str, version: Option<&str>) -> Option<SymbolAddr> {
        dl_symbol(libc::RTLD_NEXT, name, version)
    }

    fn is_own(&self, addr: SymbolAddr) -> bool {
        self.own_base != 0 && object_base(addr.as_ptr()) == Some(self.own_base)
    }

    fn open(&self, library: &str) -> Option<LibraryHandle> {
        let cname = CString::new(library).ok()?;
        // SAFETY: NUL-terminated name; the handle is never closed.
        let h = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_LAZY) };
        (!h.is_null()).then_some(LibraryHandle(h as usize))
    }

    fn in_handle(&self, handle: LibraryHandle, name: &str) -> Option<SymbolAddr> {
        dl_symbol(handle.0 as *mut c_void, name, None)
    }
}
