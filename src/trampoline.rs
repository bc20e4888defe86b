//! The control loop every fiber stack executes.
//!
//! A fresh stack starts here and never leaves. Each pass through the
//! outer loop is one lifecycle of the stack:
//!
//! 1. Loop top: consume the setup handshake, mark the fiber parked, and
//!    switch straight back to the creator. Setup therefore costs exactly
//!    two raw switches and never runs user code.
//! 2. Parked: wait to be switched in. A resume with a fresh handshake in
//!    the slot means the stack was re-set-up (new entry, rewind); go back
//!    to the loop top. A resume carrying a pending fault means this fiber
//!    was picked as a recovery target before ever running; pass the fault
//!    to its own parent. Anything else is a real activation.
//! 3. Run the entry under `catch_unwind` and dispatch the outcome: a
//!    `StopSignal` unwind parks the fiber again and hands control to the
//!    stop requester; any other panic, or the entry returning at all, is
//!    delivered to the parent as a fault.
//!
//! Frames here may be discarded without unwinding when a parked stack is
//! deleted, so nothing reference-counted is held across a park switch.
//! Fiber identity is re-fetched from the runtime status after every
//! resume instead of living in a local.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Weak;
use std::sync::atomic::Ordering;

use crate::error::{Error, StopSignal, protocol_violation};
use crate::fiber::{Entry, Phase};
use crate::raw::RawHandle;
use crate::status::{self, FAULTS_DELEGATED, Fault};

pub(crate) extern "C" fn fiber_trampoline() -> ! {
    'setup: loop {
        let mut park = take_handshake();
        'parked: loop {
            // SAFETY: `park` was captured from a live transfer record and
            // names a stack currently suspended in a raw switch.
            unsafe { status::api().switch_to(park) };
            if status::with(|st| st.handshake.is_some()) {
                continue 'setup;
            }
            if let Some(next) = parked_fault_target() {
                park = next;
                continue 'parked;
            }
            break 'parked;
        }
        let next = run_entry();
        // SAFETY: the dispatch target was validated as suspended and
        // resumable by the path that produced it.
        unsafe { status::api().switch_to(next) };
    }
}

/// Consume the setup handshake and report where to hand control back.
/// Must only run at the loop top; being here without a handshake means a
/// stopped or finished stack was switched into without a new setup.
fn take_handshake() -> RawHandle {
    status::with(|st| {
        let Some(hs) = st.handshake.take() else {
            protocol_violation("stack resumed at setup point without a handshake");
        };
        let Some(fiber) = hs.fiber.upgrade() else {
            protocol_violation("setup handshake names a dropped fiber");
        };
        fiber.borrow_mut().phase = Phase::Parked;
        st.current = hs.creator;
        hs.creator_handle
    })
}

/// If a fault was routed to this still-parked fiber, there is no entry
/// frame to deliver it into; forward it to this fiber's parent and return
/// the parent's handle. Returns `None` when no fault is pending.
fn parked_fault_target() -> Option<RawHandle> {
    status::with(|st| {
        st.pending_fault.as_ref()?;
        let Some(me) = st.current.upgrade() else {
            protocol_violation("fault routed to a dropped fiber");
        };
        let parent = {
            let inner = me.borrow();
            let Some(parent) = inner.parent.clone() else {
                protocol_violation("fault reached a parked fiber with no parent");
            };
            parent
        };
        let Some(target) = parent.inner.upgrade() else {
            protocol_violation("fault recovery parent was dropped");
        };
        let handle = {
            let t = target.borrow();
            if !matches!(t.phase, Phase::Running | Phase::Parked) {
                protocol_violation("fault recovery parent is not resumable");
            }
            let Some(handle) = t.raw else {
                protocol_violation("fault recovery parent has no stack");
            };
            handle
        };
        st.current = parent.inner;
        Some(handle)
    })
}

/// One real activation: run the entry, reinstall it for a later rewind,
/// and compute where the outcome sends control next.
fn run_entry() -> RawHandle {
    let mut entry = status::with(|st| {
        let Some(me) = st.current.upgrade() else {
            protocol_violation("activated stack does not match a live fiber");
        };
        let mut inner = me.borrow_mut();
        inner.phase = Phase::Running;
        let Some(entry) = inner.entry.take() else {
            protocol_violation("activated stack has no entry installed");
        };
        entry
    });
    let outcome = catch_unwind(AssertUnwindSafe(|| entry()));
    match outcome {
        Err(payload) if payload.is::<StopSignal>() => stopped(entry),
        Ok(()) => faulted(entry, Box::new(Error::ReturnFailure)),
        Err(payload) => faulted(entry, payload),
    }
}

/// A stop cascade unwound the entry. Mark the activation ended, keep the
/// stack parked for reuse, and hand control to whoever requested the stop.
fn stopped(entry: Entry) -> RawHandle {
    status::with(|st| {
        let Some(req) = st.pending_stop.take() else {
            protocol_violation("stop unwind finished with no requester on record");
        };
        if !Weak::ptr_eq(&req.target, &st.current) {
            protocol_violation("stop unwound on a fiber that was not its target");
        }
        let Some(me) = st.current.upgrade() else {
            protocol_violation("stopped stack does not match a live fiber");
        };
        {
            let mut inner = me.borrow_mut();
            inner.entry = Some(entry);
            inner.phase = Phase::Done;
        }
        st.current = req.requester;
        req.requester_handle
    })
}

/// The entry panicked (or returned, which counts as a fault). Record the
/// payload for the parent's in-flight switch to rethrow and hand control
/// to the parent.
fn faulted(entry: Entry, payload: Box<dyn Any + Send>) -> RawHandle {
    FAULTS_DELEGATED.fetch_add(1, Ordering::Relaxed);
    status::with(|st| {
        let Some(me) = st.current.upgrade() else {
            protocol_violation("faulted stack does not match a live fiber");
        };
        let (from, parent) = {
            let mut inner = me.borrow_mut();
            inner.entry = Some(entry);
            inner.phase = Phase::Done;
            let Some(from) = inner.raw else {
                protocol_violation("faulted fiber has no stack handle");
            };
            let Some(parent) = inner.parent.clone() else {
                protocol_violation("faulted fiber has no parent to recover on");
            };
            (from, parent)
        };
        let Some(target) = parent.inner.upgrade() else {
            protocol_violation("fault recovery parent was dropped");
        };
        let handle = {
            let t = target.borrow();
            if !matches!(t.phase, Phase::Running | Phase::Parked) {
                protocol_violation("fault recovery parent is not resumable");
            }
            let Some(handle) = t.raw else {
                protocol_violation("fault recovery parent has no stack");
            };
            handle
        };
        log::debug!("fault delegated from={from:?} to={handle:?}");
        st.pending_fault = Some(Fault { payload, from });
        st.current = parent.inner;
        handle
    })
}
