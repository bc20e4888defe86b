//! Error taxonomy and fatal-condition handling.
//!
//! Two kinds of failure exist in this library and they never mix:
//!
//! - **Local errors** ([`Error`]) are reported synchronously at the call
//!   site as an ordinary `Result` and involve no control transfer.
//! - **Delegated faults** are captured panic payloads carried across a
//!   stack switch as data and re-raised on the recovery target's stack
//!   with [`std::panic::resume_unwind`]. A fiber entry that returns
//!   normally is delegated as [`Error::ReturnFailure`].
//!
//! Protocol corruption (both handoff slots occupied, a trampoline entered
//! without a handshake, a dead parent at delegation time) is not an error
//! value at all: it aborts the process via [`protocol_violation`].

use thiserror::Error;

/// Local, synchronous errors of the public fiber contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The raw primitive could not allocate a stack. The fiber is left
    /// empty and safely droppable.
    #[error("raw stack allocation failed")]
    CreateFailure,

    /// The entry callable returned instead of suspending or running
    /// forever. There is no caller frame to return to, so this is
    /// delegated to the parent exactly like an uncaught fault; it is the
    /// payload the parent's resumed switch re-raises.
    #[error("fiber entry returned; an entry must suspend out or run forever")]
    ReturnFailure,

    /// The fiber has no entry callable (and therefore no stack) bound.
    #[error("fiber is empty; bind an entry before switching to it")]
    NotConfigured,

    /// The fiber's last activation ended (returned, stopped or faulted)
    /// and it has not been rewound or re-armed since.
    #[error("fiber already finished; rewind it before switching to it again")]
    Finished,

    /// Attempt to switch to the fiber that is already running.
    #[error("fiber is already the running fiber")]
    AlreadyCurrent,

    /// The fiber behind a `FiberRef` has been destroyed.
    #[error("fiber no longer exists")]
    Dangling,

    /// `suspend()` was called on a fiber with no parent (the thread root).
    #[error("the running fiber has no parent to suspend to")]
    NoParent,
}

/// Internal control-flow marker used to unwind an activation on request.
///
/// Raised (via `resume_unwind`, so the panic hook stays quiet) inside the
/// fiber being stopped; every live scope of its entry callable unwinds,
/// running `Drop` impls, until the trampoline catches it and hands control
/// to the stop requester.
///
/// Code inside an entry callable that uses `catch_unwind` may observe this
/// payload. It must re-raise it unmodified and immediately; swallowing it
/// stalls the stop protocol of the enclosing fiber.
#[derive(Debug)]
pub struct StopSignal;

/// Abort on a corrupted control-transfer protocol.
///
/// Unwinding is not an option here: an unwind would itself cross the
/// protocol that just proved inconsistent.
#[cold]
pub(crate) fn protocol_violation(msg: &str) -> ! {
    log::error!("fiber protocol violation: {msg}");
    eprintln!("cofiber: fatal: {msg}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_operation() {
        assert!(Error::CreateFailure.to_string().contains("allocation"));
        assert!(Error::ReturnFailure.to_string().contains("returned"));
        assert!(Error::NotConfigured.to_string().contains("empty"));
        assert!(Error::Finished.to_string().contains("rewind"));
    }

    #[test]
    fn errors_are_comparable() {
        assert_eq!(Error::Dangling, Error::Dangling);
        assert_ne!(Error::Dangling, Error::NoParent);
    }
}
