//! The raw context primitive boundary.
//!
//! [`ContextApi`] is the minimal stack-switching surface the fiber layer
//! is built on: create a stack bound to an entry point, switch to a
//! stack, report the active stack, delete a stack. The fiber layer's
//! `unsafe` blocks trust its contract, so implementing it is itself
//! unsafe.
//!
//! [`NativeContext`] is the default implementation (mapped stacks +
//! register switch). Any substitute satisfying the same contract can be
//! installed per thread with [`install_api`]; the test suites use this to
//! wrap the native implementation in a call-counting shim.

use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::arch::{SwitchContext, context_init, context_switch};
use crate::error::protocol_violation;
use crate::stack::StackMemory;

pub use crate::arch::RawEntry;

// ── Handle ──────────────────────────────────────────────────────────────

/// Opaque identity of one raw stack on the owning thread.
///
/// Compares and hashes by identity. Copying the handle never copies or
/// shares the stack; exactly one fiber owns any library-created handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RawHandle(NonNull<()>);

impl RawHandle {
    fn control(self) -> *mut StackControl {
        self.0.as_ptr().cast()
    }
}

// ── Boundary trait ──────────────────────────────────────────────────────

/// The raw stack-switching primitive, as an installable capability.
///
/// # Safety
///
/// The fiber layer dereferences and deletes through these handles, so
/// the contract is a soundness obligation. Implementations must uphold,
/// for the calling thread:
///
/// - `create` returns `None` on allocation failure, and never returns a
///   handle that aliases a live one;
/// - `switch_to` fully suspends the calling stack and resumes the target;
///   it "returns" only when something switches back;
/// - `active` reports the handle of the stack executing the call;
/// - `delete` releases a stack that is not currently active, exactly
///   once per handle.
pub unsafe trait ContextApi {
    /// Allocate a stack of `stack_size` usable bytes whose first
    /// activation jumps to `entry`.
    fn create(&self, stack_size: usize, entry: RawEntry) -> Option<RawHandle>;

    /// Transfer control to `target`.
    ///
    /// # Safety
    ///
    /// `target` must refer to a currently suspended stack created by
    /// [`ContextApi::create`] on this thread (or recognized via
    /// adoption), and must not be the active stack.
    unsafe fn switch_to(&self, target: RawHandle);

    /// Handle of the stack currently executing on this thread.
    fn active(&self) -> RawHandle;

    /// Release all resources of `handle`.
    ///
    /// # Safety
    ///
    /// `handle` must refer to a suspended stack created by
    /// [`ContextApi::create`] on this thread, and no further operation
    /// may use it afterwards.
    unsafe fn delete(&self, handle: RawHandle);
}

/// Replace the calling thread's raw primitive implementation.
///
/// The installed instance is used for every subsequent fiber operation on
/// this thread. Test harnesses install a wrapper that counts calls and
/// delegates to [`NativeContext`]; install before the first fiber
/// operation, or delegate to the implementation that was active before.
pub fn install_api(api: Rc<dyn ContextApi>) {
    crate::status::with(|st| st.api = api.clone());
}

// ── Native implementation ───────────────────────────────────────────────

/// Per-stack control block; its address doubles as the [`RawHandle`].
struct StackControl {
    ctx: SwitchContext,
    /// `None` for the thread's root stack, which the OS owns.
    memory: Option<StackMemory>,
}

thread_local! {
    /// Control block of the stack currently executing on this thread.
    /// Null until the first primitive call wraps the root stack.
    static ACTIVE: Cell<*mut StackControl> = const { Cell::new(std::ptr::null_mut()) };
}

/// Control block of the running stack, wrapping the thread root on first
/// use. The root block is deliberately never freed: it must outlive every
/// thread-local destructor that could still switch.
fn active_control() -> *mut StackControl {
    let p = ACTIVE.get();
    if !p.is_null() {
        return p;
    }
    let root = Box::into_raw(Box::new(StackControl {
        ctx: SwitchContext::new(),
        memory: None,
    }));
    ACTIVE.set(root);
    root
}

/// Default [`ContextApi`]: guard-paged mapped stacks and the in-process
/// register switch. Stateless; all bookkeeping is thread-local.
#[derive(Debug, Default)]
pub struct NativeContext;

// SAFETY: handles are addresses of heap control blocks handed out once
// per create, switching goes through the register switch, and delete
// reclaims the block exactly once.
unsafe impl ContextApi for NativeContext {
    fn create(&self, stack_size: usize, entry: RawEntry) -> Option<RawHandle> {
        let memory = StackMemory::new(stack_size)?;
        let mut control = Box::new(StackControl {
            ctx: SwitchContext::new(),
            memory: None,
        });
        // SAFETY: ctx is a fresh context and `memory.top()` bounds a
        // live mapping with ample space below it.
        unsafe { context_init(&mut control.ctx, memory.top(), entry) };
        let usable = memory.usable_size();
        control.memory = Some(memory);
        let ptr = Box::into_raw(control);
        log::debug!("raw stack created handle={ptr:p} requested={stack_size} usable={usable}");
        // SAFETY: Box::into_raw never returns null.
        Some(RawHandle(unsafe { NonNull::new_unchecked(ptr.cast()) }))
    }

    unsafe fn switch_to(&self, target: RawHandle) {
        let from = active_control();
        let to = target.control();
        if from == to {
            protocol_violation("raw switch to the active stack");
        }
        ACTIVE.set(to);
        // SAFETY: `from` is the live control block of the suspending
        // stack; `to` is valid per the caller's contract. Control comes
        // back here only when another stack switches into `from`.
        unsafe { context_switch(&mut (*from).ctx, &(*to).ctx) };
    }

    fn active(&self) -> RawHandle {
        let p = active_control();
        // SAFETY: active_control never returns null.
        RawHandle(unsafe { NonNull::new_unchecked(p.cast()) })
    }

    unsafe fn delete(&self, handle: RawHandle) {
        let p = handle.control();
        if p == ACTIVE.get() {
            protocol_violation("raw delete of the active stack");
        }
        log::debug!("raw stack deleted handle={p:p}");
        // SAFETY: The handle came from `create` (Box::into_raw) and the
        // caller guarantees it is suspended and unused afterwards.
        drop(unsafe { Box::from_raw(p) });
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn never_entered() -> ! {
        unreachable!("entry must not run in these tests");
    }

    #[test]
    fn active_is_stable_and_non_null() {
        let api = NativeContext;
        let a = api.active();
        let b = api.active();
        assert_eq!(a, b);
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn create_and_delete_round_trip() {
        let api = NativeContext;
        let h = api.create(64 * 1024, never_entered).expect("create failed");
        assert_ne!(h, api.active());
        // SAFETY: h was created above, never switched to, and never used
        // after this call.
        unsafe { api.delete(h) };
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn handles_are_distinct() {
        let api = NativeContext;
        let a = api.create(64 * 1024, never_entered).expect("create failed");
        let b = api.create(64 * 1024, never_entered).expect("create failed");
        assert_ne!(a, b);
        // SAFETY: both handles are suspended and unused afterwards.
        unsafe {
            api.delete(a);
            api.delete(b);
        }
    }
}
