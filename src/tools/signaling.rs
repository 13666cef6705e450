//! Signal plumbing for the main loop and worker processes.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Error;
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

static TERMINATED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_terminated(_signal: libc::c_int) {
    TERMINATED.store(true, Ordering::SeqCst);
}

extern "C" fn mark_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Block all maskable signals until the guard is dropped.
///
/// Used while applying an update command list, so a shutdown request
/// cannot leave the catalog half written.
pub struct SignalBlocker {
    saved: SigSet,
}

impl SignalBlocker {

    pub fn new() -> Result<Self, Error> {
        let mut saved = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut saved))?;
        Ok(Self { saved })
    }
}

impl Drop for SignalBlocker {

    fn drop(&mut self) {
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None);
    }
}

/// Convert SIGTERM into a cooperative cancellation flag.
///
/// Workers ignore SIGINT (the controlling terminal would otherwise
/// double-kill them) and only ever receive SIGTERM from the scheduler;
/// payloads poll [terminated] at their checkpoints to unwind cleanly.
pub fn convert_termination() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(mark_terminated),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGTERM, &action) }?;
    Ok(())
}

pub fn terminated() -> bool {
    TERMINATED.load(Ordering::SeqCst)
}

/// Route SIGINT and SIGTERM to the main loop shutdown flag.
pub fn install_shutdown_handlers() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(mark_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    unsafe { sigaction(Signal::SIGTERM, &action) }?;
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
