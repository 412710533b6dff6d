// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker identity and the dispatch loop.
//!
//! Each worker thread owns a `Worker` (its id plus RNG state for shard
//! sampling) and calls the scheduler's `next` to obtain work. The
//! discovery order is: sticky probe, multi-queue extract, spin with an
//! opportunistic event-loop pump, and finally, past the sleep threshold
//! and a clean sleep check, either drive the event loop or park.

use std::sync::Arc;

use super::scheduler::Scheduler;
use super::task::Task;
use crate::time::now_cycles;

/// Spins between opportunistic event-loop pumps.
const SPINS_PER_PUMP: u32 = 1000;

/// One OS worker thread's scheduler-visible state.
pub struct Worker {
    tid: u16,
    /// xorshift64 state for shard sampling. Seeded per worker so
    /// samplers do not stampede the same shards.
    pub(crate) rng: u64,
}

impl Worker {
    pub fn new(tid: u16) -> Self {
        Self {
            tid,
            rng: (tid as u64).wrapping_add(0x9E37_79B9_7F4A_7C15), // Golden ratio hash
        }
    }

    pub fn tid(&self) -> u16 {
        self.tid
    }
}

/// Obtain the next runnable task for `worker`, blocking until one is
/// claimed or the scheduler shuts down.
pub(crate) fn get_next_task(
    sched: &Scheduler,
    worker: &mut Worker,
    mut sticky: impl FnMut() -> Option<Arc<Task>>,
) -> Option<Arc<Task>> {
    let tid = worker.tid;
    let mut spins: u32 = 0;
    // Cycle stamp of the first fruitless pass; 0 = not spinning yet.
    let mut spin_start: u64 = 0;

    loop {
        sched.gc().safepoint();

        if sched.is_shutdown() {
            return None;
        }

        // Tasks pinned to this worker bypass the multi-queue entirely.
        if let Some(task) = sticky() {
            if task.try_claim(tid) {
                return Some(task);
            }
        }

        if let Some(task) = sched.multiqueue().extract(tid, &mut worker.rng) {
            return Some(task);
        }

        std::hint::spin_loop();
        spins += 1;
        if spin_start == 0 {
            spin_start = now_cycles();
        }

        if spins % SPINS_PER_PUMP == 0 {
            // Pump the event loop if nobody else is in it; a failure to
            // take the guard means a peer is already waiting there.
            if let Some(_guard) = sched.try_own_event_loop() {
                sched.event_loop().run_once_nonblocking();
            }
            continue;
        }

        let threshold = sched.sleep_threshold();
        if threshold == 0 {
            // Parking disabled: spin forever.
            continue;
        }
        if now_cycles().wrapping_sub(spin_start) < threshold {
            continue;
        }

        // Threshold passed: ask the sleep protocol for permission.
        if !sched
            .sleep()
            .sleep_check_now(|| sched.multiqueue().snapshot_empty())
        {
            // Work was seen somewhere; grant a fresh spin window before
            // checking again.
            spin_start = 0;
            continue;
        }

        if sched.is_shutdown() {
            return None;
        }

        match sched.try_own_event_loop() {
            Some(_guard) => {
                // This worker drives the loop for one blocking
                // iteration; an enqueue or I/O event kicks it back out.
                sched.gc().enter_safe_region();
                sched.event_loop().run_once_blocking();
                sched.gc().leave_safe_region();
            }
            None => {
                // Someone else owns the loop; block on our park slot.
                sched.gc().enter_safe_region();
                sched.sleep().park(tid, sched.shutdown_flag());
                sched.gc().leave_safe_region();
            }
        }

        // Woken (or the loop returned): restart discovery fresh.
        spins = 0;
        spin_start = 0;
    }
}
