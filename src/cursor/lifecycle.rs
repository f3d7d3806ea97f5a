//! Close-while-busy discipline for the resumable cursor.
//!
//! Three flags under one monitor: `closed`, `operation_in_progress`,
//! `close_pending`. `close_pending` is only ever set while an operation is
//! in progress; the completing fetch drains it.

use parking_lot::Mutex;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Flags {
    closed: bool,
    operation_in_progress: bool,
    close_pending: bool,
}

/// Outcome of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseDecision {
    /// The caller must tear down the underlying cursor and release the
    /// binding, exactly once.
    CloseNow,
    /// A fetch is in flight; teardown happens when it completes.
    Deferred,
    /// Teardown already happened.
    AlreadyClosed,
}

#[derive(Debug, Default)]
pub(crate) struct LifecycleGuard {
    flags: Mutex<Flags>,
}

impl LifecycleGuard {
    /// Marks a fetch as started.
    pub fn begin(&self, operation: &'static str) -> Result<()> {
        let mut flags = self.flags.lock();
        if flags.closed || flags.close_pending {
            return Err(Error::CursorClosed { operation });
        }
        if flags.operation_in_progress {
            return Err(Error::FetchInProgress { operation });
        }
        flags.operation_in_progress = true;
        Ok(())
    }

    /// Marks the in-flight fetch as finished. Returns true when a close
    /// was requested in the meantime and must now be carried out.
    pub fn finish(&self) -> bool {
        let mut flags = self.flags.lock();
        flags.operation_in_progress = false;
        flags.close_pending
    }

    /// Requests termination.
    pub fn request_close(&self) -> CloseDecision {
        let mut flags = self.flags.lock();
        if flags.closed {
            return CloseDecision::AlreadyClosed;
        }
        if flags.operation_in_progress {
            flags.close_pending = true;
            CloseDecision::Deferred
        } else {
            flags.closed = true;
            flags.close_pending = false;
            CloseDecision::CloseNow
        }
    }

    /// Whether the cursor is closed or a close is pending.
    pub fn is_closed(&self) -> bool {
        let flags = self.flags.lock();
        flags.closed || flags.close_pending
    }

    /// Retires the guard without teardown, for wrappers whose underlying
    /// cursor has been stolen.
    pub fn mark_closed(&self) {
        let mut flags = self.flags.lock();
        flags.closed = true;
        flags.close_pending = false;
    }
}
