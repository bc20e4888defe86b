//! Raw-primitive call accounting: every fiber operation performs an
//! exact, documented number of create/switch/delete calls. Measured with
//! a counting wrapper installed around the native primitive; each test
//! thread gets its own runtime, so installs do not interfere.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use std::cell::Cell;
use std::rc::Rc;

use cofiber::raw::RawEntry;
use cofiber::{ContextApi, Error, Fiber, NativeContext, RawHandle, install_api, suspend};

#[derive(Default)]
struct CountingApi {
    native: NativeContext,
    creates: Cell<u64>,
    switches: Cell<u64>,
    deletes: Cell<u64>,
}

impl CountingApi {
    fn install() -> Rc<CountingApi> {
        let api = Rc::new(CountingApi::default());
        install_api(api.clone());
        api
    }

    fn counts(&self) -> (u64, u64, u64) {
        (self.creates.get(), self.switches.get(), self.deletes.get())
    }
}

// SAFETY: every operation delegates to the native primitive.
unsafe impl ContextApi for CountingApi {
    fn create(&self, stack_size: usize, entry: RawEntry) -> Option<RawHandle> {
        self.creates.set(self.creates.get() + 1);
        self.native.create(stack_size, entry)
    }

    unsafe fn switch_to(&self, target: RawHandle) {
        self.switches.set(self.switches.get() + 1);
        // SAFETY: forwarded contract.
        unsafe { self.native.switch_to(target) }
    }

    fn active(&self) -> RawHandle {
        self.native.active()
    }

    unsafe fn delete(&self, handle: RawHandle) {
        self.deletes.set(self.deletes.get() + 1);
        // SAFETY: forwarded contract.
        unsafe { self.native.delete(handle) }
    }
}

/// Allocation always fails; everything else reaches the native
/// primitive.
#[derive(Default)]
struct ExhaustedApi {
    native: NativeContext,
    switches: Cell<u64>,
    deletes: Cell<u64>,
}

// SAFETY: create never hands out a handle; the other operations
// delegate to the native primitive.
unsafe impl ContextApi for ExhaustedApi {
    fn create(&self, _stack_size: usize, _entry: RawEntry) -> Option<RawHandle> {
        None
    }

    unsafe fn switch_to(&self, target: RawHandle) {
        self.switches.set(self.switches.get() + 1);
        // SAFETY: forwarded contract.
        unsafe { self.native.switch_to(target) }
    }

    fn active(&self) -> RawHandle {
        self.native.active()
    }

    unsafe fn delete(&self, handle: RawHandle) {
        self.deletes.set(self.deletes.get() + 1);
        // SAFETY: forwarded contract.
        unsafe { self.native.delete(handle) }
    }
}

#[test]
fn create_failure_leaves_an_empty_droppable_fiber() {
    let api = Rc::new(ExhaustedApi::default());
    install_api(api.clone());
    assert!(matches!(
        Fiber::new(|| suspend().unwrap()),
        Err(Error::CreateFailure)
    ));
    let mut fiber = Fiber::empty();
    assert!(matches!(
        fiber.reset_with(|| suspend().unwrap()),
        Err(Error::CreateFailure)
    ));
    // The failed setup cleared the entry again.
    assert!(matches!(fiber.switch_to(), Err(Error::NotConfigured)));
    assert!(matches!(fiber.rewind(), Err(Error::NotConfigured)));
    drop(fiber);
    assert_eq!(api.switches.get(), 0);
    assert_eq!(api.deletes.get(), 0);
}

#[test]
fn construction_is_one_create_and_a_two_switch_handshake() {
    let api = CountingApi::install();
    let fiber = Fiber::new(|| {
        suspend().unwrap();
    })
    .unwrap();
    assert_eq!(api.counts(), (1, 2, 0));
    drop(fiber);
}

#[test]
fn drop_of_a_never_switched_fiber_is_one_delete_no_switches() {
    let api = CountingApi::install();
    let fiber = Fiber::new(|| {
        suspend().unwrap();
    })
    .unwrap();
    let (_, s0, d0) = api.counts();
    drop(fiber);
    let (_, s1, d1) = api.counts();
    assert_eq!(s1 - s0, 0);
    assert_eq!(d1 - d0, 1);
}

#[test]
fn drop_of_a_suspended_fiber_is_one_stop_cascade_then_one_delete() {
    let api = CountingApi::install();
    let fiber = Fiber::new(|| {
        suspend().unwrap();
        suspend().unwrap();
    })
    .unwrap();
    fiber.switch_to().unwrap();
    let (_, s0, d0) = api.counts();
    drop(fiber);
    let (_, s1, d1) = api.counts();
    // Switch into the target, unwind on its stack, hand back.
    assert_eq!(s1 - s0, 2);
    assert_eq!(d1 - d0, 1);
}

#[test]
fn rewind_of_a_parked_fiber_is_a_handshake_only() {
    let api = CountingApi::install();
    let mut fiber = Fiber::new(|| {
        suspend().unwrap();
    })
    .unwrap();
    let (c0, s0, d0) = api.counts();
    fiber.rewind().unwrap();
    let (c1, s1, d1) = api.counts();
    assert_eq!(c1 - c0, 0);
    assert_eq!(s1 - s0, 2);
    assert_eq!(d1 - d0, 0);
}

#[test]
fn rewind_of_a_suspended_fiber_stops_first() {
    let api = CountingApi::install();
    let mut fiber = Fiber::new(|| {
        suspend().unwrap();
    })
    .unwrap();
    fiber.switch_to().unwrap();
    let (c0, s0, d0) = api.counts();
    fiber.rewind().unwrap();
    let (c1, s1, d1) = api.counts();
    assert_eq!(c1 - c0, 0);
    // Stop cascade (2) plus the fresh handshake (2); the stack survives.
    assert_eq!(s1 - s0, 4);
    assert_eq!(d1 - d0, 0);
}

#[test]
fn resize_of_a_parked_fiber_recreates_the_stack() {
    let api = CountingApi::install();
    let mut fiber = Fiber::new(|| {
        suspend().unwrap();
    })
    .unwrap();
    let (c0, s0, d0) = api.counts();
    fiber.set_stack_size(128 * 1024).unwrap();
    let (c1, s1, d1) = api.counts();
    assert_eq!(c1 - c0, 1);
    assert_eq!(d1 - d0, 1);
    assert_eq!(s1 - s0, 2);
}

#[test]
fn resize_of_a_suspended_fiber_stops_then_recreates() {
    let api = CountingApi::install();
    let mut fiber = Fiber::new(|| {
        suspend().unwrap();
    })
    .unwrap();
    fiber.switch_to().unwrap();
    let (c0, s0, d0) = api.counts();
    fiber.set_stack_size(128 * 1024).unwrap();
    let (c1, s1, d1) = api.counts();
    assert_eq!(c1 - c0, 1);
    assert_eq!(d1 - d0, 1);
    // Stop cascade (2) plus the handshake on the new stack (2).
    assert_eq!(s1 - s0, 4);
}

#[test]
fn resize_of_an_empty_fiber_touches_nothing() {
    let api = CountingApi::install();
    let mut fiber = Fiber::empty();
    fiber.set_stack_size(128 * 1024).unwrap();
    assert_eq!(api.counts(), (0, 0, 0));
}

#[test]
fn reset_with_reuses_the_existing_stack() {
    let api = CountingApi::install();
    let mut fiber = Fiber::new(|| {
        suspend().unwrap();
    })
    .unwrap();
    let (c0, _, d0) = api.counts();
    fiber
        .reset_with(|| {
            suspend().unwrap();
        })
        .unwrap();
    let (c1, _, d1) = api.counts();
    assert_eq!(c1 - c0, 0);
    assert_eq!(d1 - d0, 0);
}

#[test]
fn every_switch_goes_through_the_installed_api() {
    let api = CountingApi::install();
    let fiber = Fiber::new(|| loop {
        suspend().unwrap();
    })
    .unwrap();
    let (_, s0, _) = api.counts();
    fiber.switch_to().unwrap();
    fiber.switch_to().unwrap();
    let (_, s1, _) = api.counts();
    // Each round trip is the switch in plus the suspend back out.
    assert_eq!(s1 - s0, 4);
}
