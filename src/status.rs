//! Per-thread runtime status: the single source of truth for "who is
//! running" and for in-flight control-transfer handoffs.
//!
//! One `Status` exists per thread, created lazily on first use. Because a
//! control transfer is synchronous and total, at most one transfer is in
//! flight at any instant, so the handoff data lives in three plain
//! single-occupancy slots rather than queues:
//!
//! - `handshake` — written by setup just before the transfer that enters
//!   a fresh (or reused) stack; consumed by the trampoline.
//! - `pending_stop` — written by a stop request and addressed to one
//!   target fiber; the target's resumed switch raises the signal once,
//!   the record stays for its trampoline to consume at hand-back.
//! - `pending_fault` — written by a faulting trampoline; consumed by the
//!   recovery target's resumed switch.
//!
//! No borrow of the status cell may be held across a raw switch: every
//! transfer extracts what it needs, releases the borrow, then switches.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fiber::{DEFAULT_STACK_SIZE, FiberInner, Phase};
use crate::interop::Registry;
use crate::raw::{ContextApi, NativeContext, RawHandle};

// ── Handoff slots ───────────────────────────────────────────────────────

/// Construction parameters for the stack about to be entered.
pub(crate) struct Handshake {
    /// The fiber the entered stack belongs to.
    pub(crate) fiber: Weak<RefCell<FiberInner>>,
    /// Where the trampoline hands control straight back to.
    pub(crate) creator: Weak<RefCell<FiberInner>>,
    pub(crate) creator_handle: RawHandle,
}

/// An in-flight stop: the fiber being unwound and where control goes
/// once it has.
pub(crate) struct StopRequest {
    /// The only fiber whose resumed transfer may raise `StopSignal`.
    /// Any other fiber resumed while the cascade is in flight proceeds
    /// normally.
    pub(crate) target: Weak<RefCell<FiberInner>>,
    pub(crate) requester: Weak<RefCell<FiberInner>>,
    pub(crate) requester_handle: RawHandle,
    /// Set once the signal has been raised on the target. A later
    /// resume of the target (a drop frame transferring away and back
    /// during the unwind) must not raise it again.
    pub(crate) delivered: bool,
}

/// An in-flight fault: the captured payload and the fiber that raised it.
pub(crate) struct Fault {
    pub(crate) payload: Box<dyn Any + Send>,
    pub(crate) from: RawHandle,
}

// ── Status ──────────────────────────────────────────────────────────────

/// Thread-local runtime hub.
pub(crate) struct Status {
    /// The fiber wrapping this thread's original stack. Never owns a
    /// primitive-created stack; released by detaching only.
    pub(crate) main: Rc<RefCell<FiberInner>>,
    /// The fiber currently running on this thread.
    pub(crate) current: Weak<RefCell<FiberInner>>,
    pub(crate) handshake: Option<Handshake>,
    pub(crate) pending_stop: Option<StopRequest>,
    pub(crate) pending_fault: Option<Fault>,
    /// The installed raw primitive (swappable, see `raw::install_api`).
    pub(crate) api: Rc<dyn ContextApi>,
    /// Handle-to-fiber registry. Library stacks are tracked from the
    /// moment they exist; adopting foreign stacks is the opt-in part
    /// (see the `interop` module).
    pub(crate) registry: Registry,
}

impl Status {
    fn init() -> Status {
        let api: Rc<dyn ContextApi> = Rc::new(NativeContext);
        let root = api.active();
        let main = Rc::new(RefCell::new(FiberInner {
            raw: Some(root),
            owns_raw: false,
            entry: None,
            parent: None,
            stack_size: DEFAULT_STACK_SIZE,
            phase: Phase::Running,
        }));
        let current = Rc::downgrade(&main);
        let mut registry = Registry::new();
        registry.track(root, current.clone());
        log::debug!("runtime status initialized root={root:?}");
        Status {
            main,
            current,
            handshake: None,
            pending_stop: None,
            pending_fault: None,
            api,
            registry,
        }
    }
}

thread_local! {
    static STATUS: RefCell<Option<Status>> = const { RefCell::new(None) };
}

/// Run `f` with the thread's status, initializing it on first use.
pub(crate) fn with<R>(f: impl FnOnce(&mut Status) -> R) -> R {
    STATUS.with(|slot| {
        let mut slot = slot.borrow_mut();
        let status = slot.get_or_insert_with(Status::init);
        f(status)
    })
}

/// Like [`with`], but returns `None` once the thread-local has been torn
/// down (fiber drops during thread exit take this path).
pub(crate) fn try_with<R>(f: impl FnOnce(&mut Status) -> R) -> Option<R> {
    STATUS
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            let status = slot.get_or_insert_with(Status::init);
            f(status)
        })
        .ok()
}

/// The installed raw primitive for this thread.
pub(crate) fn api() -> Rc<dyn ContextApi> {
    with(|st| st.api.clone())
}

// ── Observability counters ──────────────────────────────────────────────

pub(crate) static FIBERS_CREATED: AtomicU64 = AtomicU64::new(0);
pub(crate) static FIBERS_ADOPTED: AtomicU64 = AtomicU64::new(0);
pub(crate) static SWITCHES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static STOPS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static FAULTS_DELEGATED: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the process-wide fiber counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Raw stacks created on behalf of fibers.
    pub fibers_created: u64,
    /// Foreign stacks adopted through the interop registry.
    pub fibers_adopted: u64,
    /// Explicit control transfers through the public switch surface.
    pub switches: u64,
    /// Stop cascades driven to completion.
    pub stops: u64,
    /// Faults carried across a stack switch to a recovery target.
    pub faults_delegated: u64,
}

/// Read the process-wide counters.
#[must_use]
pub fn stats() -> Stats {
    Stats {
        fibers_created: FIBERS_CREATED.load(Ordering::Relaxed),
        fibers_adopted: FIBERS_ADOPTED.load(Ordering::Relaxed),
        switches: SWITCHES_TOTAL.load(Ordering::Relaxed),
        stops: STOPS_TOTAL.load(Ordering::Relaxed),
        faults_delegated: FAULTS_DELEGATED.load(Ordering::Relaxed),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wraps_the_root_stack_once() {
        let first = with(|st| st.main.borrow().raw);
        let second = with(|st| st.main.borrow().raw);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn current_starts_as_main() {
        with(|st| {
            let cur = st.current.upgrade().expect("current vanished");
            assert!(Rc::ptr_eq(&cur, &st.main));
        });
    }

    #[test]
    fn handoff_slots_start_empty() {
        with(|st| {
            assert!(st.handshake.is_none());
            assert!(st.pending_stop.is_none());
            assert!(st.pending_fault.is_none());
        });
    }

    #[test]
    fn stats_snapshot_is_monotonic() {
        let before = stats();
        SWITCHES_TOTAL.fetch_add(1, Ordering::Relaxed);
        let after = stats();
        assert!(after.switches > before.switches);
    }
}
