// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sharded priority multi-queue scheduler.
//!
//! Runnable tasks sit in `c * P` independent priority heaps. Insertion
//! picks a random shard; extraction samples two and drains the one with
//! the lower head priority. Idle workers pass through a three-state sleep
//! protocol before parking so an enqueue can never slip past a sleeper.
//!
//! Components:
//! - `task`       — task handle: priority + single-claim owner token
//! - `shard`      — fixed-capacity d-ary heap behind a trylock
//! - `multiqueue` — shard array, two-choice extraction, idle snapshot
//! - `sleep`      — sleep-check state machine + per-worker park slots
//! - `reactor`    — event-loop trait and the default epoll reactor
//! - `worker`     — worker identity and the dispatch loop
//! - `scheduler`  — top-level enqueue/next/wake/shutdown surface
//! - `gc`         — collector hooks (safepoint, safe regions, traversal)

pub mod gc;
pub mod multiqueue;
pub mod reactor;
pub mod scheduler;
pub mod shard;
pub mod sleep;
pub mod task;
pub mod worker;
