#![allow(dead_code)] // not every test uses every helper
use std::{
    hash::Hasher,
    sync::atomic::{AtomicUsize, Ordering},
};
use wyhash::WyHash;

/// An atomic counter for checking an execution sequence.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Assert that the counter is equal to `old` and then replace it with
    /// `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        let got = self.counter.load(Ordering::SeqCst);
        log::debug!("{} (expected: {}) → {}", got, old, new);
        assert_eq!(got, old, "expected {}, got {}", old, got);
        self.counter.store(new, Ordering::SeqCst);
    }
}

/// A deterministic pseudo-random sequence for perturbing race schedules.
pub struct Rng {
    seed: u64,
    counter: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self { seed, counter: 0 }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut hasher = WyHash::with_seed(self.seed);
        hasher.write_u64(self.counter);
        self.counter += 1;
        hasher.finish()
    }

    /// Get a value in `0..n`.
    pub fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }
}
