//! Unrecoverable-fault primitive
//!
//! Some conditions must stop the process instead of returning an error: a
//! node that would have to undo a decided, majority-committed distributed
//! transaction cannot continue without silently breaking atomicity for
//! every other participant. Such paths call [`fatal_invariant`], which never
//! returns.

use tracing::error;

/// Log the violated invariant and abort the process.
///
/// Unlike `panic!`, this cannot be caught by `catch_unwind` and does not run
/// destructors that might flush partially updated state.
#[cold]
pub fn fatal_invariant(msg: &str) -> ! {
    error!(target: "tessera::fatal", invariant = msg, "fatal invariant violation, aborting process");
    eprintln!("tessera: fatal invariant violation: {}", msg);
    std::process::abort()
}

/// Abort the process if `cond` is false.
#[inline]
pub fn fatal_assert(cond: bool, msg: &str) {
    if !cond {
        fatal_invariant(msg);
    }
}
