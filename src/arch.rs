//! Saved-register contexts and the low-level switch itself.
//!
//! A [`SwitchContext`] holds exactly the callee-saved register file of the
//! platform ABI plus the stack pointer and a resume address. Switching
//! spills the current set into one context and restores the other; the
//! suspended side resumes at the instruction after its own last switch.
//!
//! Nothing here knows about fibers: this layer moves the CPU between
//! stacks and nothing else. Panics must never unwind through
//! [`context_switch`]; callers transport them as data across the boundary.

// ── Saved register file ─────────────────────────────────────────────────

/// Callee-saved registers captured across a stack switch.
///
/// x86_64 (System V): `rbx, rbp, r12, r13, r14, r15, rsp, rip`
/// (8 × 8 bytes). aarch64 (AAPCS64): `x19..x28`, `x29` (fp), `x30` (lr),
/// `sp`, resume pc (14 × 8 bytes).
#[repr(C)]
#[derive(Debug)]
pub struct SwitchContext {
    #[cfg(target_arch = "x86_64")]
    regs: [u64; 8],
    #[cfg(target_arch = "aarch64")]
    regs: [u64; 14],
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    regs: [u64; 8],
}

#[cfg(target_arch = "x86_64")]
const SP_SLOT: usize = 6;
#[cfg(target_arch = "x86_64")]
const PC_SLOT: usize = 7;
#[cfg(target_arch = "aarch64")]
const SP_SLOT: usize = 12;
#[cfg(target_arch = "aarch64")]
const PC_SLOT: usize = 13;

impl SwitchContext {
    /// Zeroed context; invalid as a switch target until [`context_init`]
    /// or a prior [`context_switch`] has filled it in.
    #[must_use]
    pub fn new() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            SwitchContext { regs: [0; 8] }
        }
        #[cfg(target_arch = "aarch64")]
        {
            SwitchContext { regs: [0; 14] }
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            SwitchContext { regs: [0; 8] }
        }
    }
}

impl Default for SwitchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry function bound to a fresh stack. Entered by a jump, with no
/// caller frame below it; it must never return.
pub type RawEntry = extern "C" fn() -> !;

// ── Context switch — x86_64 ─────────────────────────────────────────────

/// Suspend the running stack into `from` and resume `to`.
///
/// # Safety
///
/// * Both pointers must be valid, aligned and distinct.
/// * `to` must have been filled by [`context_init`] or by a previous
///   suspension; the stack it references must still be mapped.
/// * The call only "returns" when some other stack switches back into
///   `from`.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub unsafe fn context_switch(from: *mut SwitchContext, to: *const SwitchContext) {
    // SAFETY: Caller guarantees both contexts are valid. The assembly
    // saves and restores exactly the System V AMD64 callee-saved set plus
    // rsp and a synthetic resume address; everything else is clobbered.
    unsafe {
        std::arch::asm!(
            "mov [rdi + 0*8], rbx",
            "mov [rdi + 1*8], rbp",
            "mov [rdi + 2*8], r12",
            "mov [rdi + 3*8], r13",
            "mov [rdi + 4*8], r14",
            "mov [rdi + 5*8], r15",
            "mov [rdi + 6*8], rsp",
            "lea rax, [rip + 2f]",
            "mov [rdi + 7*8], rax",
            "mov rbx, [rsi + 0*8]",
            "mov rbp, [rsi + 1*8]",
            "mov r12, [rsi + 2*8]",
            "mov r13, [rsi + 3*8]",
            "mov r14, [rsi + 4*8]",
            "mov r15, [rsi + 5*8]",
            "mov rsp, [rsi + 6*8]",
            "jmp qword ptr [rsi + 7*8]",
            "2:",
            // The operands live in caller-saved registers so the restore
            // of the callee-saved set above cannot clobber them mid-switch.
            inout("rdi") from => _,
            inout("rsi") to => _,
            out("rax") _,
            out("rcx") _,
            out("rdx") _,
            out("r8") _,
            out("r9") _,
            out("r10") _,
            out("r11") _,
            options(nostack),
        );
    }
}

// ── Context switch — aarch64 ────────────────────────────────────────────

/// Suspend the running stack into `from` and resume `to` (aarch64).
///
/// # Safety
///
/// Same contract as the x86_64 variant.
#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub unsafe fn context_switch(from: *mut SwitchContext, to: *const SwitchContext) {
    // SAFETY: Caller guarantees both contexts are valid. The assembly
    // saves and restores exactly the AAPCS64 callee-saved set (x19-x28,
    // fp, lr) plus sp and a synthetic resume address.
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{from}, #(0*8)]",
            "stp x21, x22, [{from}, #(2*8)]",
            "stp x23, x24, [{from}, #(4*8)]",
            "stp x25, x26, [{from}, #(6*8)]",
            "stp x27, x28, [{from}, #(8*8)]",
            "stp x29, x30, [{from}, #(10*8)]",
            "mov x9, sp",
            "str x9, [{from}, #(12*8)]",
            "adr x9, 2f",
            "str x9, [{from}, #(13*8)]",
            "ldp x19, x20, [{to}, #(0*8)]",
            "ldp x21, x22, [{to}, #(2*8)]",
            "ldp x23, x24, [{to}, #(4*8)]",
            "ldp x25, x26, [{to}, #(6*8)]",
            "ldp x27, x28, [{to}, #(8*8)]",
            "ldp x29, x30, [{to}, #(10*8)]",
            "ldr x9, [{to}, #(12*8)]",
            "mov sp, x9",
            "ldr x9, [{to}, #(13*8)]",
            "br x9",
            "2:",
            from = in(reg) from,
            to = in(reg) to,
            out("x9") _,
            options(nostack),
        );
    }
}

/// Fallback for unsupported targets (not yet implemented).
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub unsafe fn context_switch(_from: *mut SwitchContext, _to: *const SwitchContext) {
    unimplemented!("context_switch is only implemented for x86_64 and aarch64");
}

// ── Context initialisation ──────────────────────────────────────────────

/// Arrange `ctx` so that the first switch into it starts `entry` at the
/// top of the stack ending at `stack_top`.
///
/// # Safety
///
/// * `ctx` must point to a valid, writable `SwitchContext`.
/// * `stack_top` must be one past the end of a mapped region with at
///   least 32 writable bytes below it.
#[cfg(target_arch = "x86_64")]
pub unsafe fn context_init(ctx: *mut SwitchContext, stack_top: *mut u8, entry: RawEntry) {
    // The entry is jumped to, not called, so rsp must already look like a
    // `call` happened: rsp ≡ 8 (mod 16) at the first instruction, with a
    // return-address slot at [rsp]. A zero in that slot terminates
    // backtraces.
    let aligned = (stack_top as usize - 16) & !15;
    let sp = aligned - 8;
    // SAFETY: `sp` lies inside the mapped stack region per caller
    // contract and is 8-aligned by construction.
    unsafe {
        *(sp as *mut u64) = 0;
        (*ctx).regs = [0; 8];
        (*ctx).regs[SP_SLOT] = sp as u64;
        (*ctx).regs[PC_SLOT] = entry as usize as u64;
    }
}

/// Arrange `ctx` so that the first switch into it starts `entry` at the
/// top of the stack ending at `stack_top` (aarch64).
///
/// # Safety
///
/// * `ctx` must point to a valid, writable `SwitchContext`.
/// * `stack_top` must be one past the end of a mapped region with at
///   least 32 writable bytes below it.
#[cfg(target_arch = "aarch64")]
pub unsafe fn context_init(ctx: *mut SwitchContext, stack_top: *mut u8, entry: RawEntry) {
    // AAPCS64 requires sp 16-aligned at every instruction. fp and lr stay
    // zero so frame walks terminate at the entry.
    let sp = (stack_top as usize - 16) & !15;
    // SAFETY: ctx is valid per caller contract; sp is computed from a
    // mapped region and never dereferenced here.
    unsafe {
        (*ctx).regs = [0; 14];
        (*ctx).regs[SP_SLOT] = sp as u64;
        (*ctx).regs[PC_SLOT] = entry as usize as u64;
    }
}

/// Fallback for unsupported targets (not yet implemented).
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub unsafe fn context_init(_ctx: *mut SwitchContext, _stack_top: *mut u8, _entry: RawEntry) {
    unimplemented!("context_init is only implemented for x86_64 and aarch64");
}

// ── Tests ───────────────────────────────────────────────────────────────
