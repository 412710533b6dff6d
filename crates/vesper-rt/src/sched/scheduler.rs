// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Top-level scheduler surface.
//!
//! Owns the multi-queue, the sleep controller, the event loop and its
//! ownership mutex, and the collector hooks. Worker threads are created
//! by the embedding runtime; they register here only through their id.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use log::{debug, error};

use crate::config::{Config, ConfigError};
use super::gc::{GcHooks, NoopGc};
use super::multiqueue::MultiQueue;
use super::reactor::{EventLoop, Reactor};
use super::shard::SchedError;
use super::sleep::{SleepController, SleepState};
use super::task::Task;
use super::worker::{get_next_task, Worker};

thread_local! {
    /// Shard-sampling RNG for enqueues from arbitrary threads. Worker
    /// threads use their `Worker` state for extraction instead.
    static ENQUEUE_RNG: Cell<u64> = Cell::new(seed_rng());
}

fn seed_rng() -> u64 {
    // Odd increment, so no thread ever lands on a zero xorshift state.
    static SEED: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);
    SEED.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed)
}

pub struct Scheduler {
    mq: MultiQueue,
    sleep: SleepController,
    event_loop: Arc<dyn EventLoop>,
    /// Grants one worker at a time the right to drive the event loop.
    loop_guard: Mutex<()>,
    gc: Arc<dyn GcHooks>,
    shutdown: AtomicBool,
    sleep_threshold: u64,
    n_workers: usize,
}

impl Scheduler {
    /// Build a scheduler with the default epoll reactor and no collector.
    pub fn new(config: &Config) -> Result<Arc<Self>, ConfigError> {
        let reactor = Arc::new(Reactor::new().expect("failed to create epoll reactor"));
        let sched = Self::with_collaborators(config, reactor.clone(), Arc::new(NoopGc))?;
        let weak: Weak<Scheduler> = Arc::downgrade(&sched);
        reactor.set_ready_handler(move |task| {
            if let Some(sched) = weak.upgrade() {
                sched.requeue_ready(task);
            }
        });
        Ok(sched)
    }

    /// Build a scheduler around caller-supplied collaborators. The caller
    /// wires the event loop's readiness delivery back to [`enqueue`]
    /// (see [`Scheduler::new`] for the default wiring).
    ///
    /// [`enqueue`]: Scheduler::enqueue
    pub fn with_collaborators(
        config: &Config,
        event_loop: Arc<dyn EventLoop>,
        gc: Arc<dyn GcHooks>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let n_workers = config.workers();
        let total_shards = config.total_shards();
        debug!(
            "scheduler init: {n_workers} workers, {total_shards} shards, \
             capacity {}, sleep threshold {}",
            config.shard_capacity, config.sleep_threshold
        );
        Ok(Arc::new(Self {
            mq: MultiQueue::new(total_shards, config.shard_capacity),
            sleep: SleepController::new(n_workers),
            event_loop,
            loop_guard: Mutex::new(()),
            gc,
            shutdown: AtomicBool::new(false),
            sleep_threshold: config.sleep_threshold,
            n_workers,
        }))
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Insert a runnable task at its current priority and wake a worker.
    ///
    /// The only error is a full shard, which the embedding runtime treats
    /// as fatal (capacity is fixed at init).
    pub fn enqueue(&self, task: Arc<Task>) -> Result<(), SchedError> {
        let priority = task.priority();
        ENQUEUE_RNG.with(|cell| {
            let mut rng = cell.get();
            let res = self.mq.insert(task, priority, &mut rng);
            cell.set(rng);
            res
        })?;
        self.wake_any(None);
        Ok(())
    }

    /// Blocking task discovery for one worker. Returns `None` only on
    /// shutdown.
    pub fn next(
        &self,
        worker: &mut Worker,
        sticky: impl FnMut() -> Option<Arc<Task>>,
    ) -> Option<Arc<Task>> {
        get_next_task(self, worker, sticky)
    }

    /// Ensure worker `tid` is not parked.
    pub fn wake(&self, tid: u16) {
        self.sleep.exchange_awake();
        self.sleep.wake_one(tid);
    }

    /// Visit every task currently waiting in the multi-queue. For the
    /// collector's stop-the-world traversal.
    pub fn mark_enqueued(&self, visitor: &mut dyn FnMut(&Arc<Task>)) {
        self.mq.visit_tasks(visitor);
    }

    /// Stop the scheduler: all `next` calls drain to `None`. Enqueued
    /// tasks stay in the shards for the embedding runtime to dispose of.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("scheduler shutdown");
        self.sleep.exchange_awake();
        self.sleep.wake_all(None);
        self.event_loop.stop();
        self.event_loop.cross_thread_wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Exchange the sleep state to awake; when anyone was checking or
    /// asleep, broadcast to the park slots and kick the event loop.
    pub(crate) fn wake_any(&self, from: Option<u16>) {
        if self.sleep.exchange_awake() != SleepState::Awake {
            self.sleep.wake_all(from);
            self.event_loop.cross_thread_wake();
        }
    }

    /// Readiness delivery from the default reactor. Shard overflow here
    /// has no caller to surface to; it is a configuration failure.
    fn requeue_ready(&self, task: Arc<Task>) {
        if let Err(e) = self.enqueue(task) {
            error!("cannot requeue ready task: {e}");
            std::process::abort();
        }
    }

    pub(crate) fn multiqueue(&self) -> &MultiQueue {
        &self.mq
    }

    pub(crate) fn sleep(&self) -> &SleepController {
        &self.sleep
    }

    pub(crate) fn gc(&self) -> &dyn GcHooks {
        &*self.gc
    }

    pub(crate) fn event_loop(&self) -> &dyn EventLoop {
        &*self.event_loop
    }

    pub(crate) fn sleep_threshold(&self) -> u64 {
        self.sleep_threshold
    }

    pub(crate) fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutdown
    }

    /// Try to become the event-loop owner. `None` means another worker
    /// is already inside the loop.
    pub(crate) fn try_own_event_loop(&self) -> Option<MutexGuard<'_, ()>> {
        match self.loop_guard.try_lock() {
            Ok(g) => Some(g),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::reactor::Interest;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn config(workers: usize, multiplier: usize, capacity: usize, threshold: u64) -> Config {
        Config {
            n_workers: workers,
            sleep_threshold: threshold,
            shard_multiplier: multiplier,
            shard_capacity: capacity,
        }
    }

    fn no_sticky() -> impl FnMut() -> Option<Arc<Task>> {
        || None
    }

    /// Spin until `cond` holds or the deadline passes.
    fn wait_for(cond: impl Fn() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn enqueue_then_next_returns_same_task() {
        let sched = Scheduler::new(&config(1, 4, 64, 100_000)).unwrap();
        let task = Task::new(5);
        sched.enqueue(task.clone()).unwrap();
        let mut w = Worker::new(0);
        let got = sched.next(&mut w, no_sticky()).unwrap();
        assert!(Arc::ptr_eq(&got, &task));
        assert_eq!(got.owner(), 0);
    }

    #[test]
    fn single_worker_extracts_in_priority_order() {
        // One shard makes the multi-queue a strict priority queue.
        let sched = Scheduler::new(&config(1, 1, 64, 100_000)).unwrap();
        for p in [5u16, 1, 9, 3, 1] {
            sched.enqueue(Task::new(p)).unwrap();
        }
        let mut w = Worker::new(0);
        let mut out = vec![];
        for _ in 0..5 {
            out.push(sched.next(&mut w, no_sticky()).unwrap().priority());
        }
        assert_eq!(out, vec![1, 1, 3, 5, 9]);
    }

    #[test]
    fn four_shards_deliver_all_tasks_once() {
        let sched = Scheduler::new(&config(1, 4, 64, 100_000)).unwrap();
        for p in [5u16, 1, 9, 3, 1] {
            sched.enqueue(Task::new(p)).unwrap();
        }
        let mut w = Worker::new(0);
        let mut out: Vec<u16> = (0..5)
            .map(|_| sched.next(&mut w, no_sticky()).unwrap().priority())
            .collect();
        out.sort_unstable();
        assert_eq!(out, vec![1, 1, 3, 5, 9]);
    }

    #[test]
    fn idle_workers_park_and_enqueue_wakes_them() {
        let sched = Scheduler::new(&config(2, 4, 64, 100_000)).unwrap();
        let (tx, rx) = mpsc::channel();

        let mut handles = vec![];
        for tid in 0..2u16 {
            let sched = sched.clone();
            let tx = tx.clone();
            handles.push(std::thread::spawn(move || {
                let mut w = Worker::new(tid);
                while let Some(task) = sched.next(&mut w, || None) {
                    tx.send((tid, task)).unwrap();
                }
            }));
        }

        // With nothing to do, some worker must commit to Asleep.
        wait_for(
            || sched.sleep().state() == SleepState::Asleep,
            "workers to fall asleep",
        );

        let task = Task::new(1);
        sched.enqueue(task.clone()).unwrap();
        let (_, got) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(Arc::ptr_eq(&got, &task));

        sched.shutdown();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn sticky_task_bypasses_multiqueue() {
        let sched = Scheduler::new(&config(1, 4, 64, 100_000)).unwrap();
        // A strictly better task sits in the multi-queue.
        sched.enqueue(Task::new(0)).unwrap();

        let sticky_task = Task::new(9);
        assert!(sticky_task.try_claim(0));

        let mut w = Worker::new(0);
        let probe = sticky_task.clone();
        let got = sched.next(&mut w, move || Some(probe.clone())).unwrap();
        assert!(Arc::ptr_eq(&got, &sticky_task));
        // The multi-queue was left untouched.
        assert!(!sched.multiqueue().snapshot_empty());
    }

    #[test]
    fn contended_delivery_is_exactly_once() {
        const TASKS: usize = 10_000;
        const WORKERS: u16 = 4;

        let sched = Scheduler::new(&config(WORKERS as usize, 4, 1024, 50_000)).unwrap();

        let mut workers = vec![];
        for tid in 0..WORKERS {
            let sched = sched.clone();
            workers.push(std::thread::spawn(move || {
                let mut w = Worker::new(tid);
                let mut got = vec![];
                while let Some(task) = sched.next(&mut w, || None) {
                    assert_eq!(task.owner(), tid as i16);
                    got.push(task);
                }
                got
            }));
        }

        let mut enqueuers = vec![];
        for _ in 0..4 {
            let sched = sched.clone();
            enqueuers.push(std::thread::spawn(move || {
                for i in 0..(TASKS / 4) {
                    sched.enqueue(Task::new((i % 100) as u16)).unwrap();
                }
            }));
        }
        for h in enqueuers {
            h.join().unwrap();
        }

        // Wait for the drain, then release the workers.
        wait_for(
            || sched.multiqueue().snapshot_empty(),
            "all tasks to drain",
        );
        sched.shutdown();

        let mut all: Vec<Arc<Task>> = vec![];
        for h in workers {
            all.extend(h.join().unwrap());
        }
        assert_eq!(all.len(), TASKS);
        let mut ptrs: Vec<*const Task> = all.iter().map(Arc::as_ptr).collect();
        ptrs.sort_unstable();
        ptrs.dedup();
        assert_eq!(ptrs.len(), TASKS, "some task was delivered twice");
    }

    #[test]
    fn capacity_overflow_surfaces_fatal_error() {
        let sched = Scheduler::new(&config(1, 1, 2, 100_000)).unwrap();
        sched.enqueue(Task::new(1)).unwrap();
        sched.enqueue(Task::new(2)).unwrap();
        assert_eq!(
            sched.enqueue(Task::new(3)),
            Err(SchedError::CapacityExceeded(2))
        );
    }

    #[test]
    fn racing_enqueuers_never_lose_a_sleeper_wakeup() {
        for _ in 0..50 {
            // Tiny threshold drives the sleeper into checking quickly.
            let sched = Scheduler::new(&config(1, 2, 64, 1_000)).unwrap();
            let (tx, rx) = mpsc::channel();

            let sleeper = {
                let sched = sched.clone();
                std::thread::spawn(move || {
                    let mut w = Worker::new(0);
                    while let Some(task) = sched.next(&mut w, || None) {
                        tx.send(task).unwrap();
                    }
                })
            };

            let mut enqueuers = vec![];
            for p in [1u16, 2] {
                let sched = sched.clone();
                enqueuers.push(std::thread::spawn(move || {
                    sched.enqueue(Task::new(p)).unwrap();
                }));
            }
            for h in enqueuers {
                h.join().unwrap();
            }

            let mut prios = vec![
                rx.recv_timeout(Duration::from_secs(5)).unwrap().priority(),
                rx.recv_timeout(Duration::from_secs(5)).unwrap().priority(),
            ];
            prios.sort_unstable();
            assert_eq!(prios, vec![1, 2]);

            sched.shutdown();
            sleeper.join().unwrap();
        }
    }

    #[test]
    fn zero_threshold_spins_without_parking() {
        let sched = Scheduler::new(&config(1, 4, 64, 0)).unwrap();
        let worker = {
            let sched = sched.clone();
            std::thread::spawn(move || {
                let mut w = Worker::new(0);
                sched.next(&mut w, || None)
            })
        };
        // The worker spins; the sleep state must never leave Awake.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sched.sleep().state(), SleepState::Awake);
        sched.shutdown();
        assert!(worker.join().unwrap().is_none());
    }

    #[test]
    fn wake_specific_worker_is_benign_when_awake() {
        let sched = Scheduler::new(&config(2, 4, 64, 100_000)).unwrap();
        // No parked workers: just an extra signal on the slot.
        sched.wake(1);
        assert_eq!(sched.sleep().state(), SleepState::Awake);
    }

    #[test]
    fn mark_enqueued_visits_pending_tasks() {
        let sched = Scheduler::new(&config(1, 4, 64, 100_000)).unwrap();
        for p in 0..10u16 {
            sched.enqueue(Task::new(p)).unwrap();
        }
        let mut seen = vec![];
        sched.mark_enqueued(&mut |t| seen.push(t.priority()));
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn reactor_readiness_feeds_the_scheduler() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let sched = Scheduler::with_collaborators(
            &config(1, 4, 64, 10_000),
            reactor.clone(),
            Arc::new(NoopGc),
        )
        .unwrap();
        {
            let weak = Arc::downgrade(&sched);
            reactor.set_ready_handler(move |task| {
                if let Some(sched) = weak.upgrade() {
                    sched.enqueue(task).unwrap();
                }
            });
        }

        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let task = Task::new(1);
        reactor
            .register(read_fd, Interest::Readable, task.clone())
            .unwrap();

        let worker = {
            let sched = sched.clone();
            std::thread::spawn(move || {
                let mut w = Worker::new(0);
                sched.next(&mut w, || None)
            })
        };

        // Let the worker settle into driving the event loop, then make
        // the FD ready.
        std::thread::sleep(Duration::from_millis(30));
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let got = worker.join().unwrap().unwrap();
        assert!(Arc::ptr_eq(&got, &task));

        sched.shutdown();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
