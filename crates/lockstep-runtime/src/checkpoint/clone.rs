//! Raw thread creation: start a kernel thread at a saved register state.
//!
//! This is the only place that bypasses pthreads.  During a restore the
//! threading library's own bookkeeping is part of the memory being
//! replaced, so recreated threads are spawned with a bare `clone` syscall
//! whose child branch loads a [`CpuRecord`] and jumps to its `rip`.
//!
//! The trampoline keeps the saved thread's red zone intact: `rip` and
//! `rflags` are staged 128 bytes below the saved stack pointer and
//! consumed with `popfq; ret 128`.

use std::arch::global_asm;

/// General purpose register indices, in `ucontext_t` gregs order.
pub const REG_R8: usize = 0;
pub const REG_R9: usize = 1;
pub const REG_RDI: usize = 8;
pub const REG_RSI: usize = 9;
pub const REG_RBP: usize = 10;
pub const REG_RBX: usize = 11;
pub const REG_RDX: usize = 12;
pub const REG_RAX: usize = 13;
pub const REG_RCX: usize = 14;
pub const REG_RSP: usize = 15;
pub const REG_RIP: usize = 16;
pub const REG_EFL: usize = 17;

/// Number of gregs carried in a record.
pub const NGREG: usize = 18;

/// Size of an `fxsave` image.
pub const FPSTATE_SIZE: usize = 512;

/// Register state of one thread.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x000   512   fpstate       (fxsave64 image)
/// 0x200   144   gregs         (r8..r15 rdi rsi rbp rbx rdx rax rcx rsp rip eflags)
/// 0x290   8     fs_base
/// 0x298   24    altstack      (stack_t installed by the trampoline, may be empty)
/// ```
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct CpuRecord {
    pub fpstate: [u8; FPSTATE_SIZE],
    pub gregs: [u64; NGREG],
    pub fs_base: u64,
    pub altstack: AltStack,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AltStack {
    pub sp: u64,
    pub flags: i32,
    pub _pad: i32,
    pub size: u64,
}

const _: () = assert!(std::mem::size_of::<CpuRecord>() == 0x2B0);
const _: () = assert!(std::mem::offset_of!(CpuRecord, gregs) == 0x200);
const _: () = assert!(std::mem::offset_of!(CpuRecord, altstack) == 0x298);
const _: () = assert!(std::mem::size_of::<AltStack>() == std::mem::size_of::<libc::stack_t>());

impl CpuRecord {
    pub const fn zeroed() -> Self {
        Self {
            fpstate: [0; FPSTATE_SIZE],
            gregs: [0; NGREG],
            fs_base: 0,
            altstack: AltStack { sp: 0, flags: 0, _pad: 0, size: 0 },
        }
    }

    pub fn rip(&self) -> u64 {
        self.gregs[REG_RIP]
    }

    pub fn rsp(&self) -> u64 {
        self.gregs[REG_RSP]
    }

    /// Fill `fpstate` from the calling thread's FPU/SSE state.
    pub fn capture_fpstate(&mut self) {
        // SAFETY: fpstate is 512 bytes and 16-byte aligned (offset 0 of an
        // align(16) struct).
        unsafe {
            std::arch::asm!(
                "fxsave64 [{0}]",
                in(reg) self.fpstate.as_mut_ptr(),
                options(nostack, preserves_flags),
            );
        }
    }

    /// Copy the interrupted state out of a signal frame.
    ///
    /// # Safety
    ///
    /// `uc` must be the `ucontext_t` passed to an `SA_SIGINFO` handler.
    pub unsafe fn from_ucontext(uc: *const libc::ucontext_t, fs_base: u64) -> Self {
        let mut rec = Self::zeroed();
        let gregs = &(*uc).uc_mcontext.gregs;
        for (i, r) in rec.gregs.iter_mut().enumerate() {
            *r = gregs[i] as u64;
        }
        let fp = (*uc).uc_mcontext.fpregs as *const u8;
        if !fp.is_null() {
            std::ptr::copy_nonoverlapping(fp, rec.fpstate.as_mut_ptr(), FPSTATE_SIZE);
        }
        rec.fs_base = fs_base;
        rec
    }

    /// Overwrite a signal frame so that `sigreturn` resumes this state.
    ///
    /// # Safety
    ///
    /// `uc` must be the `ucontext_t` passed to an `SA_SIGINFO` handler.
    pub unsafe fn write_ucontext(&self, uc: *mut libc::ucontext_t) {
        let gregs = &mut (*uc).uc_mcontext.gregs;
        for (i, r) in self.gregs.iter().enumerate() {
            gregs[i] = *r as i64;
        }
        let fp = (*uc).uc_mcontext.fpregs as *mut u8;
        if !fp.is_null() {
            std::ptr::copy_nonoverlapping(self.fpstate.as_ptr(), fp, FPSTATE_SIZE);
        }
    }
}

impl std::fmt::Debug for CpuRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuRecord")
            .field("rip", &format_args!("{:#x}", self.rip()))
            .field("rsp", &format_args!("{:#x}", self.rsp()))
            .field("fs_base", &format_args!("{:#x}", self.fs_base))
            .finish()
    }
}

const ARCH_SET_FS: libc::c_int = 0x1002;
const ARCH_GET_FS: libc::c_int = 0x1003;

/// Thread pointer of the calling thread.
pub fn fs_base() -> u64 {
    let mut base: u64 = 0;
    // SAFETY: ARCH_GET_FS writes one u64 through the pointer.
    unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_GET_FS, &mut base as *mut u64) };
    base
}

/// Replace the calling thread's thread pointer.
///
/// # Safety
///
/// `base` must point at a valid TCB for the calling thread.
pub unsafe fn set_fs_base(base: u64) {
    libc::syscall(libc::SYS_arch_prctl, ARCH_SET_FS, base);
}

/// Flags for a thread that shares everything with the process.
pub const THREAD_FLAGS: libc::c_ulong = (libc::CLONE_VM
    | libc::CLONE_FS
    | libc::CLONE_FILES
    | libc::CLONE_SIGHAND
    | libc::CLONE_THREAD
    | libc::CLONE_SYSVSEM) as libc::c_ulong;

// Child branch: r9 still holds `regs` (syscall preserves it).
global_asm!(
    ".globl lockstep_raw_clone",
    ".type lockstep_raw_clone,@function",
    "lockstep_raw_clone:",
    "    mov r10, rcx",
    "    mov eax, 56",
    "    syscall",
    "    test rax, rax",
    "    jnz 2f",
    "    cmp qword ptr [r9 + 0x2a8], 0",
    "    je 3f",
    "    lea rdi, [r9 + 0x298]",
    "    xor esi, esi",
    "    mov eax, 131",
    "    syscall",
    "3:",
    "    fxrstor64 [r9]",
    "    mov rax, [r9 + 0x200 + 15*8]",
    "    sub rax, 128",
    "    mov rcx, [r9 + 0x200 + 16*8]",
    "    mov [rax - 8], rcx",
    "    mov rcx, [r9 + 0x200 + 17*8]",
    "    mov [rax - 16], rcx",
    "    lea rsp, [rax - 16]",
    "    mov r8,  [r9 + 0x200 + 0*8]",
    "    mov r10, [r9 + 0x200 + 2*8]",
    "    mov r11, [r9 + 0x200 + 3*8]",
    "    mov r12, [r9 + 0x200 + 4*8]",
    "    mov r13, [r9 + 0x200 + 5*8]",
    "    mov r14, [r9 + 0x200 + 6*8]",
    "    mov r15, [r9 + 0x200 + 7*8]",
    "    mov rdi, [r9 + 0x200 + 8*8]",
    "    mov rsi, [r9 + 0x200 + 9*8]",
    "    mov rbp, [r9 + 0x200 + 10*8]",
    "    mov rbx, [r9 + 0x200 + 11*8]",
    "    mov rdx, [r9 + 0x200 + 12*8]",
    "    mov rax, [r9 + 0x200 + 13*8]",
    "    mov rcx, [r9 + 0x200 + 14*8]",
    "    mov r9,  [r9 + 0x200 + 1*8]",
    "    popfq",
    "    ret 128",
    "2:",
    "    ret",
    ".size lockstep_raw_clone, .-lockstep_raw_clone",
);

extern "C" {
    fn lockstep_raw_clone(
        flags: libc::c_ulong,
        stack: u64,
        ptid: *mut i32,
        ctid: *mut i32,
        tls: u64,
        regs: *const CpuRecord,
    ) -> libc::c_long;
}

/// Where the kernel should publish and clear the new thread's tid.
#[derive(Debug, Clone, Copy)]
pub struct TidSlot(pub *mut i32);

/// Start a kernel thread that resumes `regs` exactly.
///
/// When `set_tls` is true the child gets `regs.fs_base` as its thread
/// pointer.  When `tid_slot` is given the kernel writes the child's tid
/// there before returning and clears it (with a futex wake) when the
/// child exits, the same contract pthread relies on for `join`.
///
/// Returns the child's tid.
///
/// # Safety
///
/// `regs` must describe a stack and instruction pointer that are valid in
/// this address space, and must stay alive until the child has loaded it.
pub unsafe fn spawn_at(regs: &CpuRecord, set_tls: bool, tid_slot: Option<TidSlot>) -> std::io::Result<i32> {
    let mut flags = THREAD_FLAGS;
    if set_tls {
        flags |= libc::CLONE_SETTLS as libc::c_ulong;
    }
    let slot = tid_slot.map(|s| s.0).unwrap_or(std::ptr::null_mut());
    if !slot.is_null() {
        flags |= (libc::CLONE_PARENT_SETTID | libc::CLONE_CHILD_CLEARTID) as libc::c_ulong;
    }
    // The kernel needs a stack argument; the child switches away at once.
    let stack = regs.rsp().saturating_sub(256) & !0xF;
    let ret = lockstep_raw_clone(flags, stack, slot, slot, regs.fs_base, regs);
    if ret < 0 {
        return Err(std::io::Error::from_raw_os_error(-ret as i32));
    }
    Ok(ret as i32)
}

// ═══════════════════════════════════════════════════════════════════════
//  pthread tid field
// ═══════════════════════════════════════════════════════════════════════

/// Fallback index (in `i32` units) of the tid inside glibc's `struct pthread`.
pub const DEFAULT_TID_OFFSET: usize = 180;

const TID_SCAN_LIMIT: usize = 1024;

/// Locate the kernel tid inside the calling thread's `struct pthread`.
///
/// On x86_64 glibc the thread pointer is the `struct pthread` itself, so
/// the field is found by scanning forward from it for our own tid.
pub fn find_tid_offset() -> usize {
    let base = fs_base() as *const i32;
    if base.is_null() {
        return DEFAULT_TID_OFFSET;
    }
    let tid = crate::thread_state::gettid();
    // The header starts with self pointers; skip them.
    for i in 4..TID_SCAN_LIMIT {
        // SAFETY: struct pthread is larger than TID_SCAN_LIMIT ints.
        if unsafe { base.add(i).read_volatile() } == tid {
            return i;
        }
    }
    DEFAULT_TID_OFFSET
}

/// Address of the tid field for the thread whose TCB is at `fs_base`.
pub fn tid_slot(fs_base: u64, offset: usize) -> TidSlot {
    TidSlot((fs_base as *mut i32).wrapping_add(offset))
}
