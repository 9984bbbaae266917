//! `ManualClock` - a millisecond clock tests move by hand.

use std::sync::atomic::{AtomicU32, Ordering};

use gfxhost_core::traits::MonotonicClock;

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(start_ms: u32) -> Self {
        Self { now: AtomicU32::new(start_ms) }
    }

    pub fn advance(&self, ms: u32) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u32) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_wraps() {
        let c = ManualClock::new(u32::MAX - 1);
        c.advance(3);
        assert_eq!(c.now_ms(), 1);
        c.set(500);
        assert_eq!(c.now_ms(), 500);
    }
}
