//! Completion-counter arithmetic
//!
//! Hardware counters are 32-bit and wrap. All comparisons go through
//! [`reached`], a signed distance check that stays correct across the
//! wrap as long as two values are less than 2^31 apart.

use crate::constants::NB_COUNTERS;
use crate::id::CounterId;

/// Counter ids claimed by fixed-function clients at init
pub mod reserved {
    use crate::id::CounterId;

    /// Used by the host for its own bookkeeping
    pub const HOST: CounterId = CounterId::new(0);
    pub const DISP0: CounterId = CounterId::new(1);
    pub const DISP1: CounterId = CounterId::new(2);
    pub const VBLANK0: CounterId = CounterId::new(3);
    pub const VBLANK1: CounterId = CounterId::new(4);
    pub const DSI: CounterId = CounterId::new(5);

    /// Mask of every id above
    pub const MASK: u32 = 0x3f;

    /// Counters whose value is driven by the client, not accumulated
    pub const CLIENT_MANAGED_MASK: u32 = (1 << 3) | (1 << 4);
}

/// True once `hw` has caught up with `threshold` (wrap-safe).
#[inline]
pub fn reached(hw: u32, threshold: u32) -> bool {
    (hw.wrapping_sub(threshold) as i32) >= 0
}

/// A value a caller can wait on: the counter and its threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence {
    pub counter: CounterId,
    pub value: u32,
}

impl Fence {
    pub const fn new(counter: CounterId, value: u32) -> Self {
        Fence { counter, value }
    }

    #[inline]
    pub fn is_reached(&self, hw: u32) -> bool {
        reached(hw, self.value)
    }
}

/// Bitmask over the 32-counter namespace
///
/// Used for the allocation table and for the reserved/client-managed
/// sets. Lowest free bit wins, like the slot bitmaps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterMask(u32);

impl CounterMask {
    pub const EMPTY: CounterMask = CounterMask(0);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        CounterMask(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn contains(self, id: CounterId) -> bool {
        id.as_usize() < NB_COUNTERS && self.0 & (1 << id.as_u32()) != 0
    }

    #[inline]
    pub fn insert(&mut self, id: CounterId) {
        debug_assert!(id.as_usize() < NB_COUNTERS);
        self.0 |= 1 << id.as_u32();
    }

    #[inline]
    pub fn remove(&mut self, id: CounterId) {
        debug_assert!(id.as_usize() < NB_COUNTERS);
        self.0 &= !(1 << id.as_u32());
    }

    #[inline]
    pub fn is_full(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Claim the lowest clear bit, if any
    pub fn claim_lowest(&mut self) -> Option<CounterId> {
        let free = !self.0;
        if free == 0 {
            return None;
        }
        let bit = free.trailing_zeros();
        self.0 |= 1 << bit;
        Some(CounterId::new(bit))
    }

    /// Iterate over set ids in ascending order
    pub fn iter(self) -> impl Iterator<Item = CounterId> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let bit = bits.trailing_zeros();
            bits &= bits - 1;
            Some(CounterId::new(bit))
        })
    }
}
