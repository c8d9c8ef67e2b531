//! The injected instance.
//!
//! Built as `liblockstep.so` and loaded with `LD_PRELOAD`.  A load-time
//! constructor reads the configuration, waits for the controller and
//! leaves a [`Runtime`] behind for the C entry points in [`abi`], which the
//! per-API interception shims call.
//!
//! Rust's global allocator is the runtime's arena, so nothing allocated
//! here ever reaches the target's `malloc`.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::OnceLock;

use lockstep_runtime::alloc::ARENA;
use lockstep_runtime::Runtime;

pub mod abi;

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

static RUNTIME: OnceLock<&'static Runtime> = OnceLock::new();

/// The runtime, once the constructor has built it.
pub fn runtime() -> Option<&'static Runtime> {
    RUNTIME.get().copied()
}

/// Make `rt` the process runtime.  Returns it back if one was already set.
pub fn install(rt: Runtime) -> Result<&'static Runtime, Runtime> {
    if RUNTIME.get().is_some() {
        return Err(rt);
    }
    let rt: &'static Runtime = Box::leak(Box::new(rt));
    Ok(*RUNTIME.get_or_init(|| rt))
}

// ═══════════════════════════════════════════════════════════════════════
//  Load-time constructor
// ═══════════════════════════════════════════════════════════════════════

#[cfg(not(test))]
mod init {
    use log::{error, info};

    use lockstep_runtime::thread_state::{self, OwnCodeGuard};
    use lockstep_runtime::{logging, Runtime};

    #[used]
    #[link_section = ".init_array"]
    static CONSTRUCTOR: extern "C" fn() = start;

    extern "C" fn start() {
        let _own = OwnCodeGuard::on(thread_state::current());
        if let Err(e) = logging::init() {
            eprintln!("lockstep: logger already installed: {e}");
        }
        let rt = match Runtime::from_env() {
            Ok(rt) => rt,
            Err(e) => {
                error!("lockstep disabled: {}", e);
                return;
            }
        };
        let Ok(rt) = super::install(rt) else {
            return;
        };
        rt.barrier().set_presenter();
        info!(
            "lockstep {} in pid {}, {}/{} fps",
            env!("CARGO_PKG_VERSION"),
            std::process::id(),
            rt.config().fps_num,
            rt.config().fps_den
        );
        if let Err(e) = rt.connect() {
            error!("no controller, running detached: {}", e);
        }
    }
}
