//! Opt-in interop with stacks the library did not create.
//!
//! Every thread carries a registry mapping raw handles to fibers;
//! library stacks are tracked in it from creation to release, so a
//! resume that bypassed the public transfer surface still resolves to
//! the right fiber. What [`enable`] opts into is *adoption*: with it
//! on, [`crate::current`] called on a stack the registry has never seen
//! adopts that stack as a non-owning fiber on first observation, so
//! library fibers and foreign stacks can name each other in parent
//! links and transfers. Adopted fibers are owned by the registry and
//! their stacks are never deleted by the library.
//!
//! Adoption is a per-thread capability: enabling it on one thread says
//! nothing about any other.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::Ordering;

use crate::error::protocol_violation;
use crate::fiber::{DEFAULT_STACK_SIZE, FiberInner, FiberRef, Phase};
use crate::raw::RawHandle;
use crate::status::{self, FIBERS_ADOPTED, Status};

pub(crate) struct Registry {
    map: HashMap<RawHandle, Weak<RefCell<FiberInner>>>,
    /// Foreign fibers live exactly as long as the registry.
    adopted: Vec<Rc<RefCell<FiberInner>>>,
    adoption_enabled: bool,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            map: HashMap::new(),
            adopted: Vec::new(),
            adoption_enabled: false,
        }
    }

    pub(crate) fn track(&mut self, handle: RawHandle, fiber: Weak<RefCell<FiberInner>>) {
        self.map.insert(handle, fiber);
    }

    pub(crate) fn untrack(&mut self, handle: RawHandle) {
        self.map.remove(&handle);
    }
}

/// Enable foreign-stack adoption on the current thread. Idempotent.
/// Library fibers are tracked regardless of this setting, including any
/// created before the call.
pub fn enable() {
    status::with(|st| {
        if !st.registry.adoption_enabled {
            st.registry.adoption_enabled = true;
            log::debug!("foreign stack adoption enabled");
        }
    });
}

/// Whether adoption is enabled on the current thread.
#[must_use]
pub fn is_enabled() -> bool {
    status::with(|st| st.registry.adoption_enabled)
}

/// How many foreign stacks this thread has adopted.
#[must_use]
pub fn adopted_count() -> usize {
    status::with(|st| st.registry.adopted.len())
}

/// Resolve an active raw handle that is not the current fiber's. Known
/// handles resolve through the map; unknown ones are adopted as
/// non-owning fibers, or abort when adoption is disabled.
pub(crate) fn adopt(st: &mut Status, handle: RawHandle) -> FiberRef {
    if let Some(known) = st.registry.map.get(&handle) {
        if known.strong_count() > 0 {
            st.current = known.clone();
            return FiberRef { inner: known.clone() };
        }
    }
    if !st.registry.adoption_enabled {
        protocol_violation("active stack is untracked; interop::enable adopts foreign stacks");
    }
    let fiber = Rc::new(RefCell::new(FiberInner {
        raw: Some(handle),
        owns_raw: false,
        entry: None,
        parent: None,
        stack_size: DEFAULT_STACK_SIZE,
        phase: Phase::Running,
    }));
    let weak = Rc::downgrade(&fiber);
    st.registry.track(handle, weak.clone());
    st.registry.adopted.push(fiber);
    FIBERS_ADOPTED.fetch_add(1, Ordering::Relaxed);
    log::debug!("adopted foreign stack {handle:?}");
    st.current = weak.clone();
    FiberRef { inner: weak }
}
