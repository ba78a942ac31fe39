//! Signal/exit guard: guarantees rollback runs on every exit path of
//! the pre-exec window.
//!
//! Handlers only touch atomics; SIGTERM/SIGINT/SIGHUP convert to an
//! abort flag the orchestrator polls between provisioning steps. For
//! SIGSEGV/SIGABRT a best-effort rollback runs through a process-local
//! once-initialized slot before the signal is re-raised with its
//! default disposition. The journal behind the slot stays logically
//! owned by the orchestrator; rollback is idempotent, so the guard,
//! the launcher and the fatal path may each fire it.

use crate::types::{IsolateError, Result};
use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

static ABORT_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Process-local rollback slot, armed by the launcher once the journal
/// exists.
static ROLLBACK_SLOT: Mutex<Option<Box<dyn FnMut() + Send>>> = Mutex::new(None);

/// Install the abort and fatal-signal handlers. Must run before
/// provisioning starts.
pub fn install() -> Result<()> {
    let abort_action = SigAction::new(
        SigHandler::Handler(abort_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let fatal_action = SigAction::new(
        SigHandler::Handler(fatal_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );

    // SAFETY: the handlers only perform atomic stores, a try_lock on the
    // rollback slot, and signal re-raise.
    unsafe {
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            signal::sigaction(sig, &abort_action)
                .map_err(|e| IsolateError::primitive_errno("sigaction", e))?;
        }
        for sig in [Signal::SIGSEGV, Signal::SIGABRT] {
            signal::sigaction(sig, &fatal_action)
                .map_err(|e| IsolateError::primitive_errno("sigaction", e))?;
        }
    }

    debug!("exit guard installed");
    Ok(())
}

/// Arm the rollback slot. Later arms replace earlier ones.
pub fn arm(rollback: Box<dyn FnMut() + Send>) {
    *ROLLBACK_SLOT.lock().unwrap() = Some(rollback);
}

/// Clear the rollback slot. The forked child must call this first:
/// rollback belongs to the supervising parent alone.
pub fn disarm() {
    if let Ok(mut slot) = ROLLBACK_SLOT.lock() {
        *slot = None;
    }
}

/// Run the armed rollback, if any. Safe to call on any path; the
/// journal behind it is idempotent.
pub fn run_rollback() {
    if let Ok(mut slot) = ROLLBACK_SLOT.try_lock() {
        if let Some(rollback) = slot.as_mut() {
            rollback();
        }
    }
}

/// True once an external cancellation signal has arrived.
pub fn abort_requested() -> bool {
    ABORT_REQUESTED.load(Ordering::SeqCst)
}

/// Signal number that triggered the guard, 0 if none.
pub fn received_signal() -> i32 {
    SIGNAL_RECEIVED.load(Ordering::SeqCst)
}

/// Reset guard state between tests.
#[allow(dead_code)]
pub fn reset() {
    ABORT_REQUESTED.store(false, Ordering::SeqCst);
    SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    disarm();
}

extern "C" fn abort_handler(sig: libc::c_int) {
    SIGNAL_RECEIVED.store(sig, Ordering::SeqCst);
    ABORT_REQUESTED.store(true, Ordering::SeqCst);
    // Nothing else is allowed here; the provisioning loop polls the flag.
}

extern "C" fn fatal_handler(sig: libc::c_int) {
    SIGNAL_RECEIVED.store(sig, Ordering::SeqCst);
    run_rollback();
    // SAFETY: restore the default disposition and re-deliver so the
    // process still dies with the original fatal signal.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// RAII companion for the normal-exit path: dropping it fires the
/// rollback slot. Harmless after an explicit rollback.
pub struct ExitGuard {
    armed: bool,
}

impl ExitGuard {
    pub fn new() -> Self {
        Self { armed: true }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Default for ExitGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.armed {
            run_rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn install_succeeds() {
        assert!(install().is_ok());
    }

    #[test]
    fn abort_flag_round_trip() {
        reset();
        assert!(!abort_requested());
        ABORT_REQUESTED.store(true, Ordering::SeqCst);
        assert!(abort_requested());
        reset();
    }

    // The rollback slot is process-global, so its behaviors are covered
    // in one sequential test.
    #[test]
    fn rollback_slot_lifecycle() {
        reset();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        arm(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        // Dropping an armed exit guard fires the slot.
        drop(ExitGuard::new());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A disarmed exit guard does not.
        let mut guard = ExitGuard::new();
        guard.disarm();
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A cleared slot is silent.
        disarm();
        run_rollback();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        reset();
    }
}
