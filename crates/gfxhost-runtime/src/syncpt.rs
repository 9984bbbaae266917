//! Completion counters
//!
//! Hardware values live in the host's counter registers; the shadow
//! ("max") is the value each counter will reach once every queued
//! increment retires. Shadows sit behind their own lock: submitters
//! update them under the power scheduler lock, but counter allocation
//! resets them without it.
//!
//! Register accessors expect the caller to hold a `ClockGuard`.

use std::sync::{Arc, Mutex};

use gfxhost_core::constants::NB_COUNTERS;
use gfxhost_core::error::{HostError, HostResult, ResourceError};
use gfxhost_core::traits::Mmio;
use gfxhost_core::{reached, regs, CounterId, CounterMask};

pub struct Counters {
    regs: Arc<dyn Mmio>,
    shadow: Mutex<[u32; NB_COUNTERS]>,
    allocated: Mutex<CounterMask>,
    reserved: CounterMask,
    client_managed: CounterMask,
}

impl Counters {
    pub fn new(regs: Arc<dyn Mmio>, reserved: u32, client_managed: u32) -> Self {
        Self {
            regs,
            shadow: Mutex::new([0; NB_COUNTERS]),
            allocated: Mutex::new(CounterMask::from_bits(reserved)),
            reserved: CounterMask::from_bits(reserved),
            client_managed: CounterMask::from_bits(client_managed),
        }
    }

    pub fn check(id: CounterId) -> HostResult<()> {
        if id.as_usize() < NB_COUNTERS {
            Ok(())
        } else {
            Err(HostError::InvalidArgument("counter id out of range"))
        }
    }

    /// Hardware value
    pub fn read(&self, id: CounterId) -> u32 {
        self.regs.read32(regs::syncpt(id.as_u32()))
    }

    /// Shadow value
    pub fn read_max(&self, id: CounterId) -> u32 {
        self.shadow.lock().unwrap()[id.as_usize()]
    }

    /// Reserve `n` increments; returns the new shadow value.
    pub fn incr_max(&self, id: CounterId, n: u32) -> u32 {
        let mut shadow = self.shadow.lock().unwrap();
        let max = &mut shadow[id.as_usize()];
        *max = max.wrapping_add(n);
        *max
    }

    pub fn set_max(&self, id: CounterId, value: u32) {
        self.shadow.lock().unwrap()[id.as_usize()] = value;
    }

    /// Increment the hardware counter from the CPU.
    pub fn cpu_incr(&self, id: CounterId) {
        self.regs
            .write32(regs::syncpt_cpu_incr(id.as_u32()), 1 << (id.as_u32() % 32));
    }

    pub fn write(&self, id: CounterId, value: u32) {
        self.regs.write32(regs::syncpt(id.as_u32()), value);
    }

    /// Zero both the hardware value and the shadow.
    pub fn reset(&self, id: CounterId) {
        let mut shadow = self.shadow.lock().unwrap();
        shadow[id.as_usize()] = 0;
        self.write(id, 0);
    }

    pub fn is_expired(&self, id: CounterId, threshold: u32) -> bool {
        reached(self.read(id), threshold)
    }

    /// Increments queued but not yet retired. Never negative for
    /// counters the manager drives.
    pub fn outstanding(&self, id: CounterId) -> u32 {
        let hw = self.read(id);
        let max = self.read_max(id);
        debug_assert!(
            self.is_client_managed(id) || (max.wrapping_sub(hw) as i32) >= 0,
            "{} hardware 0x{:x} ran past shadow 0x{:x}",
            id,
            hw,
            max
        );
        max.wrapping_sub(hw)
    }

    pub fn is_reserved(&self, id: CounterId) -> bool {
        self.reserved.contains(id)
    }

    pub fn is_client_managed(&self, id: CounterId) -> bool {
        self.client_managed.contains(id)
    }

    pub fn all_allocated(&self) -> bool {
        self.allocated.lock().unwrap().is_full()
    }

    /// Claim the lowest free id.
    pub fn alloc(&self) -> HostResult<CounterId> {
        self.allocated
            .lock()
            .unwrap()
            .claim_lowest()
            .ok_or(HostError::Exhausted(ResourceError::NoFreeCounter))
    }

    /// Return an id to the pool. Reserved ids are never released.
    pub fn free(&self, id: CounterId) {
        if self.is_reserved(id) || id.as_usize() >= NB_COUNTERS {
            return;
        }
        self.allocated.lock().unwrap().remove(id);
    }

    pub fn allocated(&self) -> CounterMask {
        *self.allocated.lock().unwrap()
    }
}
