// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep-check state machine and per-worker park slots.
//!
//! A single tri-state atomic serializes the decision to park. A would-be
//! sleeper snapshots the shards inside the `Checking` window and commits
//! with a CAS into `Asleep`; every enqueuer exchanges the state back to
//! `Awake` after its push, so any push the snapshot missed still knocks
//! the sleeper's wait predicate false before it can block for good.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

use log::trace;

/// Global park gate. All transitions are sequentially consistent so the
/// enqueue-then-exchange handshake cannot reorder below the shard push.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepState {
    /// Runnable work may exist; nobody may park.
    Awake = 0,
    /// One worker is snapshotting the shards.
    Checking = 1,
    /// The system was observed quiescent; parking is allowed.
    Asleep = 2,
}

impl SleepState {
    fn from_u16(v: u16) -> Self {
        match v {
            0 => Self::Awake,
            1 => Self::Checking,
            _ => Self::Asleep,
        }
    }
}

/// One worker's blocking point. The mutex is held only around the wait
/// and the paired signal, never while taking other locks.
struct ParkSlot {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl ParkSlot {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }
}

pub(crate) struct SleepController {
    state: AtomicU16,
    /// Park slots, lazily initialized on first touch of each worker.
    slots: Box<[OnceLock<ParkSlot>]>,
}

impl SleepController {
    pub fn new(n_workers: usize) -> Self {
        let slots: Vec<OnceLock<ParkSlot>> =
            (0..n_workers).map(|_| OnceLock::new()).collect();
        Self {
            state: AtomicU16::new(SleepState::Awake as u16),
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn state(&self) -> SleepState {
        SleepState::from_u16(self.state.load(Ordering::SeqCst))
    }

    fn slot(&self, tid: u16) -> &ParkSlot {
        self.slots[tid as usize].get_or_init(ParkSlot::new)
    }

    /// Decide whether this worker may park, running `snapshot` inside the
    /// `Checking` window. Returns true when parking is safe.
    pub fn sleep_check_now(&self, snapshot: impl Fn() -> bool) -> bool {
        loop {
            match self.state() {
                SleepState::Checking => {
                    // Another worker owns the check; wait out its verdict.
                    loop {
                        match self.state() {
                            SleepState::Checking => std::hint::spin_loop(),
                            SleepState::Awake => return false,
                            SleepState::Asleep => return true,
                        }
                    }
                }
                SleepState::Asleep => return true,
                SleepState::Awake => {
                    if self
                        .state
                        .compare_exchange(
                            SleepState::Awake as u16,
                            SleepState::Checking as u16,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    if snapshot() {
                        // Quiescent: commit to Asleep unless an enqueuer
                        // already knocked us back to Awake.
                        return self
                            .state
                            .compare_exchange(
                                SleepState::Checking as u16,
                                SleepState::Asleep as u16,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok();
                    }
                    // Work exists. Only this worker holds Checking, so a
                    // plain store suffices unless an enqueuer exchanged
                    // first, which also lands on Awake.
                    self.state
                        .store(SleepState::Awake as u16, Ordering::SeqCst);
                    return false;
                }
            }
        }
    }

    /// Force the state to `Awake`, returning what it was. Every enqueuer
    /// calls this after its push.
    pub fn exchange_awake(&self) -> SleepState {
        SleepState::from_u16(
            self.state
                .swap(SleepState::Awake as u16, Ordering::SeqCst),
        )
    }

    /// Block worker `tid` until the state leaves `Asleep` or `shutdown`
    /// is raised. Spurious wakes re-check the predicate.
    pub fn park(&self, tid: u16, shutdown: &AtomicBool) {
        let slot = self.slot(tid);
        trace!("worker {tid} parking");
        let mut guard = slot.lock.lock().unwrap();
        while self.state() == SleepState::Asleep && !shutdown.load(Ordering::Acquire) {
            guard = slot.cvar.wait(guard).unwrap();
        }
        drop(guard);
        trace!("worker {tid} unparked");
    }

    /// Signal worker `tid`'s slot. Taking the slot mutex orders the
    /// signal against a parker that has passed its predicate check but
    /// not yet begun waiting.
    pub fn wake_one(&self, tid: u16) {
        let slot = self.slot(tid);
        let _guard = slot.lock.lock().unwrap();
        slot.cvar.notify_one();
    }

    /// Signal every worker except `from` (the baseline broadcast wake).
    pub fn wake_all(&self, from: Option<u16>) {
        for tid in 0..self.slots.len() as u16 {
            if Some(tid) != from {
                self.wake_one(tid);
            }
        }
    }
}
