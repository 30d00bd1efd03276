use crate::relay_debug;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

/// Signals held back while a frame is written.
pub const TERMINATION_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Blocks signals for the current thread until dropped, then restores the previous mask.
/// Signals delivered meanwhile stay pending and arrive after the guard is gone.
pub struct SignalGuard {
    old: Option<SigSet>,
}

impl SignalGuard {
    pub fn block(signals: &[Signal]) -> Self {
        let mut set = SigSet::empty();
        signals.iter().for_each(|sig| set.add(*sig));

        let mut old = SigSet::empty();
        match pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut old)) {
            Ok(()) => Self { old: Some(old) },
            Err(e) => {
                relay_debug!(target: "transport", "block signals: {e}");
                Self { old: None }
            }
        }
    }

    pub fn termination() -> Self {
        Self::block(&TERMINATION_SIGNALS)
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Some(old) = self.old.take() {
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None) {
                relay_debug!(target: "transport", "restore signal mask: {e}");
            }
        }
    }
}
