//! In-process generation guard.
//!
//! One counter per host runtime, incremented once per connector
//! construction. A connector whose captured generation falls behind the
//! counter is superseded and must stop; this covers the window during a
//! host reload where two connector instances briefly coexist in the
//! same process.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct GenerationCounter(AtomicU64);

impl GenerationCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Advance the counter and return the new generation. Called once
    /// per connector construction.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_are_monotonic() {
        let counter = GenerationCounter::new();
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn older_generation_observes_supersession() {
        let counter = GenerationCounter::new();
        let captured = counter.next();
        assert!(counter.current() <= captured);

        counter.next();
        assert!(counter.current() > captured);
    }
}
