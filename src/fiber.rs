//! The fiber object model: construction, control transfer, stop/reuse,
//! reconfiguration, and drop-driven teardown.
//!
//! A [`Fiber`] owns one cooperative activation: an entry callable, an
//! optional raw stack, and a parent link. Control moves only through
//! explicit transfers ([`Fiber::switch_to`], [`suspend`]); a transfer
//! blocks the calling stack until something transfers back. Teardown is
//! deterministic: dropping (or resetting) a fiber whose entry is still on
//! its stack first drives a stop cascade so the activation unwinds on its
//! own stack, running every live `Drop`, before the stack is reclaimed.
//!
//! Fibers are strictly per-thread. `Fiber` and [`FiberRef`] hold `Rc`s
//! and are `!Send`, so cross-thread misuse does not compile.

use std::cell::RefCell;
use std::panic::resume_unwind;
use std::rc::{Rc, Weak};
use std::sync::atomic::Ordering;

use crate::error::{Error, StopSignal, protocol_violation};
use crate::interop;
use crate::raw::RawHandle;
use crate::status::{self, FIBERS_CREATED, Handshake, STOPS_TOTAL, StopRequest, SWITCHES_TOTAL};
use crate::trampoline::fiber_trampoline;

/// Default stack size in bytes: a quarter MiB of pointers, the
/// traditional cooperative-threading recommendation.
pub const DEFAULT_STACK_SIZE: usize = (1 << 20) / 4 * size_of::<*const ()>();

pub(crate) type Entry = Box<dyn FnMut()>;

/// Where a fiber is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// No raw stack; an entry may or may not be installed.
    Empty,
    /// Stack exists and its trampoline is parked; entry has not begun
    /// (or was stopped and the stack awaits reuse).
    Parked,
    /// The entry callable has been entered and has not yet returned,
    /// stopped, or faulted. Includes suspended activations.
    Running,
    /// The activation ended (returned, stopped or faulted); the stack is
    /// parked for reuse but needs a rewind or reset before it can be
    /// switched to again.
    Done,
}

pub(crate) struct FiberInner {
    pub(crate) raw: Option<RawHandle>,
    /// False for the thread root and adopted foreign stacks; their
    /// release is a detach, never a delete.
    pub(crate) owns_raw: bool,
    pub(crate) entry: Option<Entry>,
    pub(crate) parent: Option<FiberRef>,
    pub(crate) stack_size: usize,
    pub(crate) phase: Phase,
}

// ── Handles ─────────────────────────────────────────────────────────────

/// An owning fiber handle.
///
/// Dropping it stops any in-progress activation and reclaims the stack.
/// `Fiber` is move-only; moving it never disturbs a suspended activation,
/// which resumes exactly where it left off.
pub struct Fiber {
    inner: Rc<RefCell<FiberInner>>,
}

/// A non-owning fiber handle, used for parent links and for talking
/// about fibers you do not own (the current fiber, adopted stacks).
/// Operations on a `FiberRef` whose fiber has been dropped report
/// [`Error::Dangling`].
#[derive(Clone)]
pub struct FiberRef {
    pub(crate) inner: Weak<RefCell<FiberInner>>,
}

impl PartialEq for FiberRef {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for FiberRef {}

impl std::fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberRef")
            .field("fiber", &self.inner.as_ptr())
            .field("dangling", &(self.inner.strong_count() == 0))
            .finish()
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let i = self.inner.borrow();
        f.debug_struct("Fiber")
            .field("raw", &i.raw)
            .field("phase", &i.phase)
            .field("stack_size", &i.stack_size)
            .finish()
    }
}

// ── Construction ────────────────────────────────────────────────────────

impl Fiber {
    /// An empty fiber: no entry, no stack, default stack size, parented
    /// to the calling fiber. Configure it later with [`reset_with`]
    /// (entry) or [`set_stack_size`] / [`set_parent`].
    ///
    /// [`reset_with`]: Fiber::reset_with
    /// [`set_stack_size`]: Fiber::set_stack_size
    /// [`set_parent`]: Fiber::set_parent
    #[must_use]
    pub fn empty() -> Fiber {
        Fiber {
            inner: Rc::new(RefCell::new(FiberInner {
                raw: None,
                owns_raw: true,
                entry: None,
                parent: Some(current()),
                stack_size: DEFAULT_STACK_SIZE,
                phase: Phase::Empty,
            })),
        }
    }

    /// A fiber running `entry` on a default-size stack, parented to the
    /// calling fiber. The stack is allocated and initialized here; the
    /// entry does not run until the first [`switch_to`].
    ///
    /// [`switch_to`]: Fiber::switch_to
    pub fn new(entry: impl FnMut() + 'static) -> Result<Fiber, Error> {
        Fiber::build(Box::new(entry), DEFAULT_STACK_SIZE, current())
    }

    /// Like [`Fiber::new`] with an explicit stack size in bytes.
    pub fn with_stack_size(entry: impl FnMut() + 'static, stack_size: usize) -> Result<Fiber, Error> {
        Fiber::build(Box::new(entry), stack_size, current())
    }

    /// Like [`Fiber::new`] with an explicit parent. The parent is the
    /// default suspension target and receives this fiber's faults.
    pub fn with_parent(entry: impl FnMut() + 'static, parent: &FiberRef) -> Result<Fiber, Error> {
        Fiber::build(Box::new(entry), DEFAULT_STACK_SIZE, parent.clone())
    }

    fn build(entry: Entry, stack_size: usize, parent: FiberRef) -> Result<Fiber, Error> {
        let fiber = Fiber {
            inner: Rc::new(RefCell::new(FiberInner {
                raw: None,
                owns_raw: true,
                entry: Some(entry),
                parent: Some(parent),
                stack_size,
                phase: Phase::Empty,
            })),
        };
        setup_inner(&fiber.inner)?;
        Ok(fiber)
    }
}

// ── Accessors ───────────────────────────────────────────────────────────

impl Fiber {
    /// True while the entry callable is on this fiber's stack, whether
    /// currently running or suspended.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.borrow().phase == Phase::Running
    }

    /// Configured stack size in bytes.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.inner.borrow().stack_size
    }

    /// This fiber's parent link, if any.
    #[must_use]
    pub fn parent(&self) -> Option<FiberRef> {
        self.inner.borrow().parent.clone()
    }

    /// Replace the parent link. For a running fiber this takes effect at
    /// the next stop or fault cascade.
    ///
    /// # Panics
    ///
    /// A fiber cannot be its own parent.
    pub fn set_parent(&mut self, parent: FiberRef) {
        assert!(
            !std::ptr::eq(parent.inner.as_ptr(), Rc::as_ptr(&self.inner)),
            "a fiber cannot be its own parent"
        );
        self.inner.borrow_mut().parent = Some(parent);
    }

    /// A non-owning reference to this fiber.
    #[must_use]
    pub fn as_ref(&self) -> FiberRef {
        FiberRef { inner: Rc::downgrade(&self.inner) }
    }
}

impl FiberRef {
    /// True while the referenced fiber exists and its entry is on its
    /// stack. A dangling reference reports false.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|rc| rc.borrow().phase == Phase::Running)
    }

    /// True once the referenced fiber has been dropped.
    #[must_use]
    pub fn is_dangling(&self) -> bool {
        self.inner.strong_count() == 0
    }

    /// Transfer control to the referenced fiber. See [`Fiber::switch_to`].
    pub fn switch_to(&self) -> Result<(), Error> {
        let Some(rc) = self.inner.upgrade() else {
            return Err(Error::Dangling);
        };
        switch_to_inner(&rc)
    }
}

// ── Control transfer ────────────────────────────────────────────────────

impl Fiber {
    /// Transfer control to this fiber and block until something transfers
    /// back.
    ///
    /// A parked fiber begins its entry; a suspended one resumes exactly
    /// where it suspended. On the way back in, a fault delegated to the
    /// calling fiber is re-raised here via `resume_unwind`, as if it
    /// happened inline; if the calling fiber is the target of an
    /// in-flight stop, [`StopSignal`] is raised instead and must be
    /// re-raised unmodified by anything that observes it.
    pub fn switch_to(&self) -> Result<(), Error> {
        switch_to_inner(&self.inner)
    }

    /// Stop any in-progress activation, clear the entry, and release the
    /// stack, returning the fiber to the empty state.
    pub fn reset(&mut self) {
        stop_inner(&self.inner);
        self.inner.borrow_mut().entry = None;
        release_inner(&self.inner);
    }

    /// Stop any in-progress activation and install a new entry, reusing
    /// the existing stack when there is one.
    pub fn reset_with(&mut self, entry: impl FnMut() + 'static) -> Result<(), Error> {
        stop_inner(&self.inner);
        self.inner.borrow_mut().entry = Some(Box::new(entry));
        setup_inner(&self.inner)
    }

    /// Stop any in-progress activation and set the fiber up to run its
    /// entry again from the top. No reallocation; side effects of the
    /// entry are reproduced on the next switch. [`Error::NotConfigured`]
    /// when no entry is installed.
    pub fn rewind(&mut self) -> Result<(), Error> {
        // The entry of a running fiber is checked out onto its stack and
        // only reinstalled by the stop cascade, so stop before checking.
        stop_inner(&self.inner);
        if self.inner.borrow().entry.is_none() {
            return Err(Error::NotConfigured);
        }
        setup_inner(&self.inner)
    }

    /// Change the stack size. On an empty fiber this only records the
    /// size. On a configured one, parked or not, the reallocation is
    /// immediate: any in-progress activation is stopped, the old stack
    /// deleted, and the fiber set up again on a fresh stack of the new
    /// size.
    pub fn set_stack_size(&mut self, stack_size: usize) -> Result<(), Error> {
        if self.inner.borrow().raw.is_none() {
            self.inner.borrow_mut().stack_size = stack_size;
            return Ok(());
        }
        stop_inner(&self.inner);
        release_inner(&self.inner);
        self.inner.borrow_mut().stack_size = stack_size;
        setup_inner(&self.inner)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // During thread teardown the runtime status may already be gone;
        // the stack is leaked rather than switched into.
        if status::try_with(|_| ()).is_none() {
            return;
        }
        stop_inner(&self.inner);
        release_inner(&self.inner);
    }
}

// ── Free functions ──────────────────────────────────────────────────────

/// The fiber currently running on this thread.
///
/// With adoption enabled (see [`crate::interop::enable`]), a foreign
/// stack the raw primitive reports as active is adopted on first
/// observation. Without it, observing a stack the registry has never
/// seen is protocol corruption and aborts.
#[must_use]
pub fn current() -> FiberRef {
    let active = status::api().active();
    status::with(|st| {
        if let Some(cur) = st.current.upgrade() {
            if cur.borrow().raw == Some(active) {
                return FiberRef { inner: st.current.clone() };
            }
        }
        interop::adopt(st, active)
    })
}

/// Transfer control to the current fiber's parent, the conventional
/// suspension point. [`Error::NoParent`] on the thread root.
pub fn suspend() -> Result<(), Error> {
    let parent = status::with(|st| {
        let Some(me) = st.current.upgrade() else {
            protocol_violation("running fiber is no longer tracked");
        };
        me.borrow().parent.clone()
    });
    let Some(parent) = parent else {
        return Err(Error::NoParent);
    };
    parent.switch_to()
}

// ── Internal operations ─────────────────────────────────────────────────

/// Create the raw stack if needed and run the setup handshake: two raw
/// transfers that let the trampoline capture the fiber's identity, after
/// which the stack parks awaiting its first real switch.
///
/// On allocation failure the entry is cleared and the fiber is left
/// empty and safely droppable.
pub(crate) fn setup_inner(inner: &Rc<RefCell<FiberInner>>) -> Result<(), Error> {
    let api = status::api();
    let handle = {
        let existing = inner.borrow().raw;
        match existing {
            Some(h) => h,
            None => {
                let stack_size = inner.borrow().stack_size;
                let Some(h) = api.create(stack_size, fiber_trampoline) else {
                    let mut i = inner.borrow_mut();
                    i.entry = None;
                    i.phase = Phase::Empty;
                    return Err(Error::CreateFailure);
                };
                FIBERS_CREATED.fetch_add(1, Ordering::Relaxed);
                let mut i = inner.borrow_mut();
                i.raw = Some(h);
                i.owns_raw = true;
                h
            }
        }
    };
    let creator_handle = api.active();
    status::with(|st| {
        st.handshake = Some(Handshake {
            fiber: Rc::downgrade(inner),
            creator: st.current.clone(),
            creator_handle,
        });
        st.current = Rc::downgrade(inner);
        st.registry.track(handle, Rc::downgrade(inner));
    });
    // SAFETY: `handle` is a stack this thread created (or one parked at
    // the trampoline loop top); the handshake it consumes is in place.
    unsafe { api.switch_to(handle) };
    Ok(())
}

/// Drive a stop cascade if the fiber's entry is on its stack: record the
/// target and this fiber as the requester, transfer in so the target's
/// in-flight switch raises [`StopSignal`] and unwinds down to its
/// trampoline, which hands control back here. No-op otherwise.
///
/// The pending-stop slot is saved and restored around the cascade so
/// stops issued by `Drop` impls during another fiber's unwind nest.
/// Control coming back here before the target has unwound to its
/// trampoline is protocol corruption and aborts; the caller is about to
/// reclaim the target's stack.
pub(crate) fn stop_inner(inner: &Rc<RefCell<FiberInner>>) {
    let handle = {
        let i = inner.borrow();
        if i.phase != Phase::Running {
            return;
        }
        let Some(h) = i.raw else {
            protocol_violation("running fiber has no stack handle");
        };
        h
    };
    let api = status::api();
    let requester_handle = api.active();
    if requester_handle == handle {
        protocol_violation("a fiber cannot stop itself");
    }
    STOPS_TOTAL.fetch_add(1, Ordering::Relaxed);
    log::trace!("stop target={handle:?} requester={requester_handle:?}");
    let saved = status::with(|st| {
        let saved = st.pending_stop.take();
        st.pending_stop = Some(StopRequest {
            target: Rc::downgrade(inner),
            requester: st.current.clone(),
            requester_handle,
            delivered: false,
        });
        st.current = Rc::downgrade(inner);
        saved
    });
    // SAFETY: the target is suspended inside a transfer on this thread;
    // its resumed switch observes the pending stop and unwinds.
    unsafe { api.switch_to(handle) };
    status::with(|st| st.pending_stop = saved);
    if inner.borrow().phase != Phase::Done {
        protocol_violation("control returned to the stop requester before the target unwound");
    }
}

/// Release the raw stack: owned stacks are deleted, non-owned ones
/// (thread root, adopted) merely detached. Leaves the fiber empty.
pub(crate) fn release_inner(inner: &Rc<RefCell<FiberInner>>) {
    let (handle, owns) = {
        let mut i = inner.borrow_mut();
        i.phase = Phase::Empty;
        (i.raw.take(), i.owns_raw)
    };
    let Some(handle) = handle else { return };
    status::with(|st| st.registry.untrack(handle));
    if owns {
        // SAFETY: the stack is parked at its trampoline loop, not active.
        unsafe { status::api().delete(handle) };
    }
}

/// The transfer core shared by `Fiber::switch_to` and `FiberRef::switch_to`.
pub(crate) fn switch_to_inner(target: &Rc<RefCell<FiberInner>>) -> Result<(), Error> {
    let handle = {
        let i = target.borrow();
        if i.phase == Phase::Done {
            return Err(Error::Finished);
        }
        let Some(h) = i.raw else {
            return Err(Error::NotConfigured);
        };
        h
    };
    let api = status::api();
    if api.active() == handle {
        return Err(Error::AlreadyCurrent);
    }
    SWITCHES_TOTAL.fetch_add(1, Ordering::Relaxed);
    log::trace!("switch to={handle:?}");
    status::with(|st| st.current = Rc::downgrade(target));
    // SAFETY: the target stack is suspended (parked trampoline or an
    // in-flight transfer) and was created or adopted on this thread.
    unsafe { api.switch_to(handle) };
    post_transfer_checks();
    Ok(())
}

enum Resume {
    Normal,
    Stop,
    Fault(Box<dyn std::any::Any + Send>),
}

/// Epilogue of every public transfer: re-raise whatever was delegated to
/// this stack while it was suspended. A pending stop raises [`StopSignal`]
/// exactly once, on its recorded target; the record stays in place for
/// the target's trampoline to consume at the bottom of the unwind. Any
/// other fiber resumed while the cascade is in flight, and the target's
/// own drop frames transferring back in mid-unwind, proceed normally.
pub(crate) fn post_transfer_checks() {
    let resume = status::with(|st| {
        if let Some(req) = st.pending_stop.as_mut() {
            if Weak::ptr_eq(&req.target, &st.current) {
                if st.pending_fault.is_some() {
                    protocol_violation("stop and fault both pending on the same fiber");
                }
                if req.delivered {
                    return Resume::Normal;
                }
                req.delivered = true;
                return Resume::Stop;
            }
        }
        if let Some(fault) = st.pending_fault.take() {
            log::trace!("fault taken from={:?}", fault.from);
            Resume::Fault(fault.payload)
        } else {
            Resume::Normal
        }
    });
    match resume {
        Resume::Normal => {}
        Resume::Stop => resume_unwind(Box::new(StopSignal)),
        Resume::Fault(payload) => resume_unwind(payload),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fiber_accessors() {
        let fiber = Fiber::empty();
        assert!(!fiber.is_running());
        assert_eq!(fiber.stack_size(), DEFAULT_STACK_SIZE);
        assert_eq!(fiber.parent(), Some(current()));
    }

    #[test]
    fn empty_fiber_records_stack_size_without_allocating() {
        let mut fiber = Fiber::empty();
        fiber.set_stack_size(64 * 1024).unwrap();
        assert_eq!(fiber.stack_size(), 64 * 1024);
        assert!(fiber.inner.borrow().raw.is_none());
    }

    #[test]
    fn switch_to_empty_fiber_is_not_configured() {
        let fiber = Fiber::empty();
        assert!(matches!(fiber.switch_to(), Err(Error::NotConfigured)));
    }

    #[test]
    fn rewind_empty_fiber_is_not_configured() {
        let mut fiber = Fiber::empty();
        assert!(matches!(fiber.rewind(), Err(Error::NotConfigured)));
    }

    #[test]
    #[should_panic(expected = "cannot be its own parent")]
    fn self_parenting_panics() {
        let mut fiber = Fiber::empty();
        let me = fiber.as_ref();
        fiber.set_parent(me);
    }

    #[test]
    fn refs_compare_by_identity() {
        let a = Fiber::empty();
        let b = Fiber::empty();
        assert_eq!(a.as_ref(), a.as_ref());
        assert_ne!(a.as_ref(), b.as_ref());
    }

    #[test]
    fn dropped_fiber_leaves_dangling_refs() {
        let fiber = Fiber::empty();
        let r = fiber.as_ref();
        assert!(!r.is_dangling());
        drop(fiber);
        assert!(r.is_dangling());
        assert!(!r.is_running());
        assert!(matches!(r.switch_to(), Err(Error::Dangling)));
    }

    #[test]
    fn current_is_stable_on_the_root() {
        assert_eq!(current(), current());
        assert!(matches!(suspend(), Err(Error::NoParent)));
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    mod native {
        use super::*;
        use std::cell::Cell;

        #[test]
        fn entry_runs_on_first_switch_only() {
            let hits = Rc::new(Cell::new(0));
            let h = hits.clone();
            let fiber = Fiber::new(move || {
                h.set(h.get() + 1);
                suspend().unwrap();
            })
            .unwrap();
            assert_eq!(hits.get(), 0);
            assert!(!fiber.is_running());
            fiber.switch_to().unwrap();
            assert_eq!(hits.get(), 1);
            assert!(fiber.is_running());
        }

        #[test]
        fn drop_of_suspended_fiber_runs_entry_drops() {
            struct Tally(Rc<Cell<bool>>);
            impl Drop for Tally {
                fn drop(&mut self) {
                    self.0.set(true);
                }
            }
            let dropped = Rc::new(Cell::new(false));
            let d = dropped.clone();
            let fiber = Fiber::new(move || {
                let _tally = Tally(d.clone());
                suspend().unwrap();
                suspend().unwrap();
            })
            .unwrap();
            fiber.switch_to().unwrap();
            assert!(!dropped.get());
            drop(fiber);
            assert!(dropped.get());
        }

        #[test]
        fn rewind_reproduces_side_effects() {
            let hits = Rc::new(Cell::new(0));
            let h = hits.clone();
            let mut fiber = Fiber::new(move || {
                h.set(h.get() + 1);
                suspend().unwrap();
            })
            .unwrap();
            fiber.switch_to().unwrap();
            assert_eq!(hits.get(), 1);
            fiber.rewind().unwrap();
            assert!(!fiber.is_running());
            fiber.switch_to().unwrap();
            assert_eq!(hits.get(), 2);
        }
    }
}
