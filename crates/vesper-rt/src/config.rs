// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Worker count and sleep threshold come from init parameters or the
//! environment; shard layout is fixed once the scheduler is built.

use std::thread;

use thiserror::Error;

/// Worker count environment override.
pub const NUM_THREADS_VAR: &str = "VESPER_NUM_THREADS";
/// Sleep threshold override: cycles, or `"infinite"` (never park).
pub const SLEEP_THRESHOLD_VAR: &str = "VESPER_THREAD_SLEEP_THRESHOLD";

/// Default busy-wait window before a worker considers parking, in cycles.
const DEFAULT_SLEEP_THRESHOLD: u64 = 4_000_000;

/// Default shard multiplier: shards = multiplier * workers.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Default per-shard task capacity.
const DEFAULT_SHARD_CAPACITY: usize = 1024;

/// Errors from malformed configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: expected a positive integer, got `{value}`")]
    InvalidWorkerCount { var: &'static str, value: String },

    #[error("{var}: expected a cycle count or `infinite`, got `{value}`")]
    InvalidThreshold { var: &'static str, value: String },

    #[error("worker count {0} exceeds the 16-bit id space")]
    TooManyWorkers(usize),

    #[error("shard capacity {0} exceeds the 16-bit count range")]
    CapacityTooLarge(usize),

    #[error("shard multiplier must be at least 1")]
    ZeroMultiplier,
}

/// Scheduler tuning. Fixed for the lifetime of the scheduler.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker thread count P. 0 selects the available parallelism.
    pub n_workers: usize,
    /// Spin window in cycles before a worker may park. 0 = never park.
    pub sleep_threshold: u64,
    /// Shards per worker (the multi-queue holds `shard_multiplier * P`).
    pub shard_multiplier: usize,
    /// Fixed per-shard heap capacity.
    pub shard_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_workers: 0,
            sleep_threshold: DEFAULT_SLEEP_THRESHOLD,
            shard_multiplier: DEFAULT_SHARD_MULTIPLIER,
            shard_capacity: DEFAULT_SHARD_CAPACITY,
        }
    }
}

impl Config {
    /// Build a config from defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var(NUM_THREADS_VAR) {
            cfg.n_workers = parse_workers(&v)?;
        }
        if let Ok(v) = std::env::var(SLEEP_THRESHOLD_VAR) {
            cfg.sleep_threshold = parse_threshold(&v)?;
        }
        Ok(cfg)
    }

    /// Resolved worker count (available parallelism when 0 was given).
    pub fn workers(&self) -> usize {
        if self.n_workers == 0 {
            thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
        } else {
            self.n_workers
        }
    }

    /// Total shard count for the multi-queue.
    pub fn total_shards(&self) -> usize {
        self.shard_multiplier * self.workers()
    }

    /// Check bounds that the scheduler's 16-bit fields rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_multiplier == 0 {
            return Err(ConfigError::ZeroMultiplier);
        }
        let workers = self.workers();
        // Owner ids are i16 with -1 reserved for "unowned".
        if workers > i16::MAX as usize {
            return Err(ConfigError::TooManyWorkers(workers));
        }
        if self.shard_capacity > u16::MAX as usize {
            return Err(ConfigError::CapacityTooLarge(self.shard_capacity));
        }
        Ok(())
    }
}

fn parse_workers(value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidWorkerCount {
            var: NUM_THREADS_VAR,
            value: value.to_string(),
        }),
    }
}

fn parse_threshold(value: &str) -> Result<u64, ConfigError> {
    let v = value.trim();
    // "infinite" disables parking entirely: workers spin forever.
    if v.eq_ignore_ascii_case("infinite") {
        return Ok(0);
    }
    v.parse::<u64>().map_err(|_| ConfigError::InvalidThreshold {
        var: SLEEP_THRESHOLD_VAR,
        value: value.to_string(),
    })
}
