//! Critical-section / signal-mask discipline (design.md §5).
//!
//! Creating and removing tunnels must be uninterruptible by the "terminate"
//! family of signals (interrupt, quit, terminate): an external `SIGTERM`
//! must not land between forking the Supervisor and recording it in the
//! Manager's registry, or between signalling a child and dropping its
//! registry entry. We block that family for the duration of a
//! [`CriticalSection`] guard and restore the previous mask when it drops.
//!
//! Children inherit the blocked mask across `fork()`. The first thing the
//! child does, before `exec`, is unblock everything again — otherwise the
//! SSH client would be born deaf to its own `SIGTERM`/`SIGINT`.

use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};

use crate::error::Result;

fn terminate_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGQUIT);
    set.add(Signal::SIGTERM);
    set
}

/// An active signal mask. Blocks the terminate family on construction and
/// restores the prior mask on drop, so a `?` out of the guarded block still
/// unblocks correctly.
pub struct CriticalSection {
    previous: SigSet,
}

impl CriticalSection {
    pub fn enter() -> Result<Self> {
        let to_block = terminate_signals();
        let mut previous = SigSet::empty();
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&to_block), Some(&mut previous))?;
        Ok(Self { previous })
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let result =
            signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
        if let Err(e) = result {
            log::warn!("failed to restore signal mask after critical section: {}", e);
        }
    }
}

/// Must be called in the child immediately after `fork()`, before `exec`.
/// Undoes whatever the parent had blocked in its enclosing critical
/// section, since the child inherited that mask.
pub fn unblock_all_in_child() -> Result<()> {
    let empty = SigSet::empty();
    signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&empty), None)?;
    Ok(())
}
