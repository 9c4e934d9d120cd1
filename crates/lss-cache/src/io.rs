//! Per-extent I/O latch.
//!
//! An extent whose contents are being filled from disk, or whose record is
//! being appended to the log, carries a pending latch. Every thread that
//! finds the extent in that window blocks on the same latch and observes the
//! same outcome.

use lss_error::{LssError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug)]
enum IoPhase {
    Idle,
    Pending,
    Failed(Arc<LssError>),
}

#[derive(Debug)]
pub struct IoWait {
    phase: Mutex<IoPhase>,
    condvar: Condvar,
}

impl Default for IoWait {
    fn default() -> Self {
        Self::new()
    }
}

impl IoWait {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(IoPhase::Idle),
            condvar: Condvar::new(),
        }
    }

    /// Mark I/O as in flight. Panics if already pending.
    pub fn set_pending(&self) {
        let mut phase = self.phase.lock();
        assert!(
            !matches!(*phase, IoPhase::Pending),
            "I/O latch armed twice"
        );
        *phase = IoPhase::Pending;
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(*self.phase.lock(), IoPhase::Pending)
    }

    /// Resolve the latch successfully and wake all waiters.
    pub fn complete(&self) {
        {
            let mut phase = self.phase.lock();
            if matches!(*phase, IoPhase::Pending) {
                *phase = IoPhase::Idle;
            }
        }
        self.condvar.notify_all();
    }

    /// Resolve the latch with `error` and wake all waiters.
    ///
    /// The failure is sticky: later waiters see it too.
    pub fn fail(&self, error: &LssError) {
        {
            let mut phase = self.phase.lock();
            *phase = IoPhase::Failed(Arc::new(error.replicate()));
        }
        self.condvar.notify_all();
    }

    /// Block until no I/O is pending.
    pub fn wait(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        loop {
            match &*phase {
                IoPhase::Idle => return Ok(()),
                IoPhase::Failed(err) => return Err(err.replicate()),
                IoPhase::Pending => self.condvar.wait(&mut phase),
            }
        }
    }
}
