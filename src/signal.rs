//! Unix signal handling (SIGINT).
//!
//! The first SIGINT only sets a flag: the scheduler stops dispatching, and
//! nodes already running are left to finish.  Their child processes get the
//! terminal's SIGINT too and normally fail on their own.  The handler then
//! restores the default action, so a second SIGINT kills kiln outright.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Flag set once SIGINT has been received.
pub fn interrupted() -> &'static AtomicBool {
    &INTERRUPTED
}

#[cfg(unix)]
fn sigint_action(handler: libc::sighandler_t) {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigint_handler(_sig: libc::c_int) {
    // Only async-signal-safe work here: an atomic store and sigaction().
    INTERRUPTED.store(true, Ordering::SeqCst);
    sigint_action(libc::SIG_DFL);
}

#[cfg(unix)]
pub fn register_sigint() {
    sigint_action(sigint_handler as extern "C" fn(libc::c_int) as libc::sighandler_t);
}

#[cfg(not(unix))]
pub fn register_sigint() {}
