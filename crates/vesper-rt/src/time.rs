// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Monotonic time source.
//!
//! The sleep threshold is expressed in cycles of this counter; only
//! differences are meaningful.

/// Current monotonic cycle count (nanosecond resolution).
pub fn now_cycles() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_monotone() {
        let a = now_cycles();
        let b = now_cycles();
        assert!(b >= a);
    }

    #[test]
    fn cycles_advance() {
        let a = now_cycles();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_cycles();
        assert!(b - a >= 1_000_000);
    }
}
