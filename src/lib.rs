//! cofiber — cooperative fibers with deterministic teardown.
//!
//! A minimal raw stack-switching primitive (create a stack bound to an
//! entry point, switch to a stack, report the active stack, delete a
//! stack) turned into a safe, composable fiber abstraction: explicit
//! control transfer, hierarchical parent links, stop cascades that unwind
//! an activation on its own stack, and cross-stack fault delegation.
//!
//! The crate is layered leaf-first:
//!
//! - `arch` (internal) — saved-register switch contexts and the
//!   inline-asm context switch for x86_64 and aarch64.
//! - `stack` (internal) — page-rounded stack allocation with a guard
//!   page at the bottom.
//! - [`raw`] — the primitive boundary: [`RawHandle`], the object-safe
//!   [`ContextApi`] trait, the default [`NativeContext`], and
//!   [`install_api`] for substituting the primitive per thread.
//! - `status` (internal) — per-thread runtime hub: main fiber, current
//!   fiber, in-flight handoff slots, installed primitive, registry.
//! - `fiber` — the public object model: [`Fiber`], [`FiberRef`],
//!   [`current`], [`suspend`].
//! - `trampoline` (internal) — the reuse loop bound to every
//!   library-created stack.
//! - [`interop`] — opt-in adoption of stacks the library did not create.
//!
//! # Example
//!
//! ```no_run
//! use cofiber::{Fiber, suspend};
//!
//! let fiber = Fiber::new(|| {
//!     println!("first activation");
//!     suspend().unwrap();
//!     println!("second activation");
//!     suspend().unwrap();
//! })?;
//! fiber.switch_to()?; // prints "first activation"
//! fiber.switch_to()?; // prints "second activation"
//! drop(fiber);        // unwinds the suspended activation, frees the stack
//! # Ok::<(), cofiber::Error>(())
//! ```
//!
//! Fibers are strictly per-thread; `Fiber` and `FiberRef` are `!Send`.
//! Panics inside an entry are caught on the fiber's stack, carried across
//! the switch as data, and re-raised on the parent's stack.

#![warn(missing_docs)]

mod arch;
mod error;
mod fiber;
pub mod interop;
pub mod raw;
mod stack;
mod status;
mod trampoline;

pub use error::{Error, StopSignal};
pub use fiber::{DEFAULT_STACK_SIZE, Fiber, FiberRef, current, suspend};
pub use raw::{ContextApi, NativeContext, RawHandle, install_api};
pub use status::{Stats, stats};
