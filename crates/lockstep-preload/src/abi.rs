//! C entry points for interception shims.
//!
//! Every call outside the guard accessors runs in own-code mode.  Calls
//! made before the runtime exists (or after it failed to start) return
//! the documented "no runtime" value, usually `-1` or null.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, c_int, c_void, CStr};

use lockstep_protocol::INPUT_VECTOR_SIZE;
use lockstep_runtime::symbols::{FeatureArea, LibraryHandle, Namespace};
use lockstep_runtime::thread_state::{self, InheritedMode, OwnCodeGuard};
use lockstep_runtime::{runtime as assembled, Crossing, Runtime, WaitOutcome};

use crate::runtime;

fn with_runtime<R>(absent: R, f: impl FnOnce(&'static Runtime) -> R) -> R {
    match runtime() {
        Some(rt) => {
            let _own = OwnCodeGuard::new();
            f(rt)
        }
        None => absent,
    }
}

fn wait_code(outcome: WaitOutcome) -> c_int {
    match outcome {
        WaitOutcome::Ready => 0,
        WaitOutcome::TimedOut => 1,
        WaitOutcome::Terminated => 2,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Reentrancy guards
// ═══════════════════════════════════════════════════════════════════════

#[no_mangle]
pub extern "C" fn lockstep_enter_native() {
    thread_state::current().enter_native();
}

#[no_mangle]
pub extern "C" fn lockstep_exit_native() {
    thread_state::current().exit_native();
}

#[no_mangle]
pub extern "C" fn lockstep_enter_own_code() {
    thread_state::current().enter_own_code();
}

#[no_mangle]
pub extern "C" fn lockstep_exit_own_code() {
    thread_state::current().exit_own_code();
}

#[no_mangle]
pub extern "C" fn lockstep_enter_no_log() {
    thread_state::current().enter_no_log();
}

#[no_mangle]
pub extern "C" fn lockstep_exit_no_log() {
    thread_state::current().exit_no_log();
}

#[no_mangle]
pub extern "C" fn lockstep_is_native() -> c_int {
    thread_state::current().is_native() as c_int
}

#[no_mangle]
pub extern "C" fn lockstep_is_own_code() -> c_int {
    thread_state::current().is_own_code() as c_int
}

#[no_mangle]
pub extern "C" fn lockstep_is_no_log() -> c_int {
    thread_state::current().is_no_log() as c_int
}

// ═══════════════════════════════════════════════════════════════════════
//  Threads
// ═══════════════════════════════════════════════════════════════════════

const MODE_NATIVE: u32 = 1;
const MODE_OWN_CODE: u32 = 2;

/// Called by the creating thread; pass the result to the new thread.
#[no_mangle]
pub extern "C" fn lockstep_thread_spawn_mode() -> u32 {
    let mode = assembled::spawn_mode();
    (mode.native as u32 * MODE_NATIVE) | (mode.own_code as u32 * MODE_OWN_CODE)
}

/// First call on a new thread, with the creator's mode.
#[no_mangle]
pub extern "C" fn lockstep_thread_started(mode: u32) {
    assembled::thread_started(InheritedMode {
        native: mode & MODE_NATIVE != 0,
        own_code: mode & MODE_OWN_CODE != 0,
    });
}

/// Last call on a thread before it exits.
#[no_mangle]
pub extern "C" fn lockstep_thread_exiting() {
    assembled::thread_exiting();
}

// ═══════════════════════════════════════════════════════════════════════
//  Frames and time
// ═══════════════════════════════════════════════════════════════════════

/// A frame is being presented.  Returns the frame now current, or 0
/// without a runtime.  Does not return when the session was terminated.
#[no_mangle]
pub extern "C" fn lockstep_frame_boundary() -> u64 {
    let crossing = with_runtime(None, |rt| Some(rt.frame_boundary()));
    match crossing {
        Some(Crossing::Advanced { frame, .. } | Crossing::Observed { frame, .. }) => frame,
        Some(Crossing::Terminated) => {
            log::logger().flush();
            std::process::exit(0)
        }
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn lockstep_frame() -> u64 {
    with_runtime(0, |rt| rt.barrier().frame())
}

/// Deterministic replacement for `clock_gettime`.
#[no_mangle]
pub unsafe extern "C" fn lockstep_clock_gettime(ts: *mut libc::timespec) -> c_int {
    if ts.is_null() {
        return -1;
    }
    with_runtime(-1, |rt| {
        ts.write(rt.barrier().now().as_timespec());
        0
    })
}

/// Sleep for `ns` of deterministic time.  0 when the time elapsed, 2 when
/// the session ended first, -1 without a runtime.
#[no_mangle]
pub extern "C" fn lockstep_sleep_ns(ns: u64) -> c_int {
    with_runtime(-1, |rt| wait_code(rt.barrier().sleep(ns)))
}

/// Wait until `ready(arg)` returns non-zero or deterministic time reaches
/// `deadline_ns`.  0 ready, 1 timed out, 2 terminated, -1 no runtime.
///
/// `ready` runs with the barrier locked and must not call back into it.
#[no_mangle]
pub unsafe extern "C" fn lockstep_timed_wait(
    deadline_ns: u64,
    ready: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    arg: *mut c_void,
) -> c_int {
    with_runtime(-1, |rt| {
        let deadline = lockstep_runtime::clock::Ticks::from_nanos(deadline_ns);
        let outcome = rt.barrier().timed_wait(deadline, || match ready {
            Some(f) => f(arg) != 0,
            None => false,
        });
        wait_code(outcome)
    })
}

/// Block until the next frame starts, the deterministic stand-in for a
/// blocking poll.  0 ready, 2 terminated, -1 no runtime.
#[no_mangle]
pub extern "C" fn lockstep_wait_next_frame() -> c_int {
    with_runtime(-1, |rt| {
        let b = rt.barrier();
        wait_code(b.wait_for_frame(b.frame()))
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Inputs and randomness
// ═══════════════════════════════════════════════════════════════════════

/// Copy the current input vector, in wire layout, into `out`.
#[no_mangle]
pub unsafe extern "C" fn lockstep_inputs(out: *mut u8, len: usize) -> c_int {
    if out.is_null() || len < INPUT_VECTOR_SIZE {
        return -1;
    }
    with_runtime(-1, |rt| {
        let mut buf = [0u8; INPUT_VECTOR_SIZE];
        rt.barrier().inputs().encode(&mut buf);
        std::ptr::copy_nonoverlapping(buf.as_ptr(), out, INPUT_VECTOR_SIZE);
        0
    })
}

#[no_mangle]
pub unsafe extern "C" fn lockstep_fill_random(buf: *mut u8, len: usize) -> c_int {
    if buf.is_null() {
        return -1;
    }
    with_runtime(-1, |rt| {
        rt.barrier().fill_random(std::slice::from_raw_parts_mut(buf, len));
        0
    })
}

#[no_mangle]
pub extern "C" fn lockstep_rand() -> c_int {
    with_runtime(-1, |rt| rt.barrier().c_rand())
}

// ═══════════════════════════════════════════════════════════════════════
//  Symbols
// ═══════════════════════════════════════════════════════════════════════

fn area(n: u32) -> FeatureArea {
    FeatureArea::from_index(n).unwrap_or(FeatureArea::Other)
}

/// Real address of `name` outside this library, falling back to opening
/// `library` when it is not null.  Null on failure, which disables `area`.
#[no_mangle]
pub unsafe extern "C" fn lockstep_resolve(name: *const c_char, library: *const c_char, area_index: u32) -> *mut c_void {
    if name.is_null() {
        return std::ptr::null_mut();
    }
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return std::ptr::null_mut();
    };
    let namespace = if library.is_null() {
        Namespace::Global
    } else {
        Namespace::GlobalOr(CStr::from_ptr(library).to_string_lossy().into_owned())
    };
    with_runtime(std::ptr::null_mut(), |rt| match rt.symbols().resolve_for(area(area_index), name, &namespace) {
        Ok(addr) => addr.as_ptr() as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    })
}

/// Address of `name` inside the object `handle` from `dlopen`.
#[no_mangle]
pub unsafe extern "C" fn lockstep_resolve_in(handle: *mut c_void, name: *const c_char, area_index: u32) -> *mut c_void {
    if name.is_null() || handle.is_null() {
        return std::ptr::null_mut();
    }
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return std::ptr::null_mut();
    };
    let namespace = Namespace::Handle(LibraryHandle(handle as usize));
    with_runtime(std::ptr::null_mut(), |rt| match rt.symbols().resolve_for(area(area_index), name, &namespace) {
        Ok(addr) => addr.as_ptr() as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    })
}

#[no_mangle]
pub extern "C" fn lockstep_feature_enabled(area_index: u32) -> c_int {
    with_runtime(0, |rt| rt.symbols().is_enabled(area(area_index)) as c_int)
}
