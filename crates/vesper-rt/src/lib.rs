// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Vesper runtime scheduler library.
//!
//! Lightweight tasks on a fixed pool of OS worker threads. Runnable tasks
//! live in a sharded collection of priority heaps; idle workers park on
//! per-worker condition variables and are woken on enqueue or I/O events.
//!
//! Components:
//! - config — worker count, sleep threshold, shard tuning
//! - sched  — multi-queue, sleep/wake protocol, dispatch loop, reactor
//! - time   — monotonic cycle counter

pub mod config;
pub mod sched;
pub mod time;
