// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One shard of the multi-queue: a fixed-capacity d-ary min-heap of task
//! handles behind a non-blocking mutex.
//!
//! Cross-shard visible state is two atomics: `count` (for the idle
//! snapshot) and a cached head priority (for two-choice sampling). The
//! cache is advisory; the heap under the lock is authoritative.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::sync::Arc;

use thiserror::Error;

use super::task::Task;

/// Heap arity. Each node has up to this many children.
pub(crate) const HEAP_ARITY: usize = 8;

/// Head-priority cache value for an empty shard. Priorities are 16-bit,
/// so the sentinel sits safely outside their range.
pub(crate) const EMPTY_PRIO: u32 = u32::MAX;

/// Errors surfaced out of the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedError {
    /// A shard was full at insert. Capacity is fixed at init, so this is a
    /// configuration failure; the embedding runtime aborts on it.
    #[error("shard capacity {0} exceeded; per-shard capacity is fixed at init")]
    CapacityExceeded(usize),
}

pub(crate) struct Shard {
    heap: Mutex<Vec<Arc<Task>>>,
    capacity: usize,
    /// Priority of the heap root, or [`EMPTY_PRIO`]. Advisory: extraction
    /// re-validates under the lock before committing a pop.
    head_prio: AtomicU32,
    /// Occupancy, readable without the lock for the idle snapshot.
    count: AtomicU16,
}

/// Exclusive access to one shard's heap. Structural mutations go through
/// this guard so `count` and the head cache stay in step with the heap.
pub(crate) struct ShardGuard<'a> {
    shard: &'a Shard,
    heap: MutexGuard<'a, Vec<Arc<Task>>>,
}

impl Shard {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            head_prio: AtomicU32::new(EMPTY_PRIO),
            count: AtomicU16::new(0),
        }
    }

    /// Non-blocking lock. `None` means contended; callers resample.
    pub fn try_lock(&self) -> Option<ShardGuard<'_>> {
        match self.heap.try_lock() {
            Ok(heap) => Some(ShardGuard { shard: self, heap }),
            Err(TryLockError::WouldBlock) => None,
            // A panic while holding a shard lock is fatal to the runtime
            // anyway; recover the guard so other shards stay usable.
            Err(TryLockError::Poisoned(e)) => Some(ShardGuard {
                shard: self,
                heap: e.into_inner(),
            }),
        }
    }

    /// Cached head priority. Acquire pairs with the release publish done
    /// under the shard lock.
    pub fn load_head_prio(&self) -> u32 {
        self.head_prio.load(Ordering::Acquire)
    }

    /// Lower the cached head priority after an unlocked insert observed a
    /// stale cache. Single-shot CAS: if the cache moved underneath us an
    /// authoritative publish already happened and we must not clobber it.
    pub fn cas_head_prio_down(&self, seen: u32, new: u32) {
        if new < seen {
            let _ = self.head_prio.compare_exchange(
                seen,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Occupancy without the lock. Unsynchronized by design; the sleep
    /// protocol tolerates a stale read.
    pub fn count_relaxed(&self) -> u16 {
        self.count.load(Ordering::Relaxed)
    }

    /// Visit every enqueued task handle. Stop-the-world only: the caller
    /// guarantees no mutator holds or wants the shard locks.
    pub fn visit_tasks(&self, visitor: &mut dyn FnMut(&Arc<Task>)) {
        let heap = match self.heap.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        for task in heap.iter() {
            visitor(task);
        }
    }
}

impl ShardGuard<'_> {
    /// Insert a task handle, restoring heap order.
    pub fn push(&mut self, task: Arc<Task>) -> Result<(), SchedError> {
        if self.heap.len() == self.shard.capacity {
            return Err(SchedError::CapacityExceeded(self.shard.capacity));
        }
        self.heap.push(task);
        let last = self.heap.len() - 1;
        sift_up(&mut self.heap, last);
        self.shard
            .count
            .store(self.heap.len() as u16, Ordering::Release);
        Ok(())
    }

    /// Remove and return the minimum-priority task, republishing the head
    /// cache while the lock is still held.
    pub fn pop_head(&mut self) -> Option<Arc<Task>> {
        if self.heap.is_empty() {
            return None;
        }
        let head = self.heap.swap_remove(0);
        if !self.heap.is_empty() {
            sift_down(&mut self.heap, 0);
        }
        self.shard
            .count
            .store(self.heap.len() as u16, Ordering::Release);
        self.publish_head_prio();
        Some(head)
    }

    /// The current minimum-priority task, if any.
    pub fn head(&self) -> Option<&Arc<Task>> {
        self.heap.first()
    }

    /// True head priority read from the heap, not the cache.
    pub fn head_prio(&self) -> u32 {
        self.heap
            .first()
            .map(|t| t.priority() as u32)
            .unwrap_or(EMPTY_PRIO)
    }

    /// Store the authoritative head priority into the cache.
    pub fn publish_head_prio(&self) {
        self.shard
            .head_prio
            .store(self.head_prio(), Ordering::Release);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

fn parent(i: usize) -> usize {
    (i - 1) / HEAP_ARITY
}

fn sift_up(heap: &mut [Arc<Task>], mut i: usize) {
    while i > 0 {
        let p = parent(i);
        if heap[i].priority() < heap[p].priority() {
            heap.swap(i, p);
            i = p;
        } else {
            break;
        }
    }
}

fn sift_down(heap: &mut [Arc<Task>], mut i: usize) {
    loop {
        let first_child = HEAP_ARITY * i + 1;
        if first_child >= heap.len() {
            break;
        }
        let last_child = (first_child + HEAP_ARITY).min(heap.len());
        // First-wins on ties keeps the choice deterministic.
        let mut min = i;
        for c in first_child..last_child {
            if heap[c].priority() < heap[min].priority() {
                min = c;
            }
        }
        if min == i {
            break;
        }
        heap.swap(i, min);
        i = min;
    }
}
