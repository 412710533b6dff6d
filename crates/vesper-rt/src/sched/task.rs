// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task handle as seen by the scheduler.
//!
//! The scheduler never allocates, runs, or frees tasks; it stores handles
//! and claims them for exactly one worker. The embedding runtime keeps the
//! actual task body (stack, continuation, closure) elsewhere.

use std::sync::atomic::{AtomicI16, AtomicU16, Ordering};
use std::sync::Arc;

/// Owner sentinel: the task is not claimed by any worker.
pub const UNOWNED: i16 = -1;

/// Scheduling descriptor for one task.
///
/// `priority` is smaller-is-higher. `owner_tid` is a claim token: a worker
/// that wins the CAS from [`UNOWNED`] to its own id is the only worker
/// allowed to run the task.
pub struct Task {
    priority: AtomicU16,
    owner_tid: AtomicI16,
}

impl Task {
    pub fn new(priority: u16) -> Arc<Self> {
        Arc::new(Self {
            priority: AtomicU16::new(priority),
            owner_tid: AtomicI16::new(UNOWNED),
        })
    }

    pub fn priority(&self) -> u16 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Set the priority. Only valid while the task is outside the
    /// multi-queue; heap order is not repaired after the fact.
    pub fn set_priority(&self, priority: u16) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn owner(&self) -> i16 {
        self.owner_tid.load(Ordering::Acquire)
    }

    /// Claim the task for worker `tid`.
    ///
    /// Succeeds if the task is unowned (winning the CAS) or already owned
    /// by `tid`. Fails if another worker holds the claim.
    pub fn try_claim(&self, tid: u16) -> bool {
        let tid = tid as i16;
        if self.owner_tid.load(Ordering::Acquire) == tid {
            return true;
        }
        self.owner_tid
            .compare_exchange(UNOWNED, tid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop the claim. The embedding runtime calls this before a task that
    /// yielded is re-enqueued.
    pub fn clear_owner(&self) {
        self.owner_tid.store(UNOWNED, Ordering::Release);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("priority", &self.priority())
            .field("owner_tid", &self.owner())
            .finish()
    }
}
