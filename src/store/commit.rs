//! Commit gate shared between a timed store call and the task waiting on it.
//!
//! The waiting side abandons the gate when its timeout fires; the store
//! side must pass the gate before committing a write. Whichever side gets
//! there first wins, so a call reported as timed out never commits.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

const RUNNING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

#[derive(Debug, Default)]
pub(crate) struct CommitGate {
    state: AtomicU8,
}

impl CommitGate {
    /// Returns `false` if a commit is already under way, in which case the
    /// caller has to wait for the call to finish instead.
    pub(crate) fn abandon(&self) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == ABANDONED,
        }
    }

    fn begin_commit(&self) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == COMMITTING,
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<CommitGate>>> = const { RefCell::new(None) };
}

struct Reset;

impl Drop for Reset {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

/// Runs `f` on the current thread with `gate` installed.
pub(crate) fn scoped<T>(gate: Arc<CommitGate>, f: impl FnOnce() -> T) -> T {
    CURRENT.with(|current| *current.borrow_mut() = Some(gate));
    let _reset = Reset;
    f()
}

/// Fails with `Error::Timeout` when the surrounding call was abandoned.
/// Calls made outside [`scoped`] always pass.
pub(crate) fn ensure_may_commit() -> Result<()> {
    let allowed = CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_none_or(|gate| gate.begin_commit())
    });

    if allowed { Ok(()) } else { Err(Error::Timeout) }
}
