//! Spin backoff between compare-exchange retries.

use core::hint;

/// Default number of spin iterations between retries of a contended
/// publication step (waiting out a concurrent `creating` phase, or waiting
/// for in-flight inserters to drain).
pub const DEFAULT_SPIN: usize = 1 << 17;

/// Spins for roughly `n` iterations.
#[inline]
pub fn spin_for(n: usize) {
    for _ in 0..n {
        hint::spin_loop();
    }
}

/// Truncated exponential backoff for CAS retry loops.
///
/// Doubles the spin count on every `snooze` up to a fixed ceiling; CAS loops
/// that expect to win quickly call `snooze` only after a failed exchange.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const CEILING: u32 = 10;

    pub const fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    pub fn snooze(&mut self) {
        spin_for(1usize << self.step.min(Self::CEILING));
        if self.step < Self::CEILING {
            self.step += 1;
        }
    }
}
