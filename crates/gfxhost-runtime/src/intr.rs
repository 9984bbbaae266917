//! Interrupt plumbing
//!
//! Threshold interrupts use two mask bits per counter (CPU0 and CPU1);
//! only the CPU0 bit is ever set here. The mask registers are
//! write-only in practice, so a shadow copy is kept and written whole.
//!
//! The general line reports bus timeouts from modules behind the host.
//! They are logged and recorded in a `FaultLog`, never fatal.
//!
//! Register accessors expect the caller to hold a `ClockGuard`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gfxhost_core::constants::NB_COUNTERS;
use gfxhost_core::error::{BusFault, FaultKind};
use gfxhost_core::regs::{self, sync};
use gfxhost_core::traits::Mmio;
use gfxhost_core::{kwarn, CounterId};

/// Spread 16 bits over the even bit positions of a word.
#[inline]
pub const fn bit_widen_16_to_32(v: u16) -> u32 {
    let mut v = v as u32;
    v = (v | (v << 8)) & 0x00ff_00ff;
    v = (v | (v << 4)) & 0x0f0f_0f0f;
    v = (v | (v << 2)) & 0x3333_3333;
    v = (v | (v << 1)) & 0x5555_5555;
    v
}

/// Shadowed threshold interrupt mask
pub struct ThresholdIrq {
    regs: Arc<dyn Mmio>,
    mask: [u32; 2],
}

impl ThresholdIrq {
    pub fn new(regs: Arc<dyn Mmio>) -> Self {
        Self { regs, mask: [0; 2] }
    }

    fn flush(&self, word: usize) {
        self.regs
            .write32(regs::thresh_int_mask(word as u32), self.mask[word]);
    }

    pub fn is_enabled(&self, id: CounterId) -> bool {
        let i = id.as_usize();
        self.mask[i / 16] & (1 << ((i % 16) * 2)) != 0
    }

    /// Program `thresh` and enable the counter's interrupt.
    pub fn enable(&mut self, id: CounterId, thresh: u32) {
        let i = id.as_usize();
        debug_assert!(!self.is_enabled(id), "{} threshold already armed", id);
        self.regs
            .write32(regs::syncpt_int_thresh(id.as_u32()), thresh);
        self.mask[i / 16] |= 1 << ((i % 16) * 2);
        self.flush(i / 16);
    }

    /// Move the threshold of an armed counter.
    pub fn set_threshold(&self, id: CounterId, thresh: u32) {
        debug_assert!(self.is_enabled(id));
        self.regs
            .write32(regs::syncpt_int_thresh(id.as_u32()), thresh);
    }

    /// Enable every counter in `ids`, each with its own threshold.
    pub fn enable_mult(&mut self, ids: u32, thresh: &[u32; NB_COUNTERS]) {
        if ids == 0 {
            return;
        }
        for bit in 0..NB_COUNTERS as u32 {
            if ids & (1 << bit) != 0 {
                self.regs
                    .write32(regs::syncpt_int_thresh(bit), thresh[bit as usize]);
            }
        }
        for word in 0..2 {
            let half = (ids >> (word * 16)) as u16;
            if half != 0 {
                self.mask[word] |= bit_widen_16_to_32(half);
                self.flush(word);
            }
        }
    }

    pub fn disable(&mut self, id: CounterId) {
        self.disable_mult(1 << id.as_u32());
    }

    /// Disable both CPU bits of every counter in `ids`.
    pub fn disable_mult(&mut self, ids: u32) {
        for word in 0..2 {
            let half = (ids >> (word * 16)) as u16;
            if half == 0 {
                continue;
            }
            let mut widened = bit_widen_16_to_32(half);
            widened |= widened << 1;
            self.mask[word] &= !widened;
            self.flush(word);
        }
    }

    pub fn enabled_mask(&self) -> [u32; 2] {
        self.mask
    }

    /// Latched threshold status for CPU0
    pub fn status(&self) -> u32 {
        self.regs.read32(regs::sync_reg(sync::THRESH_CPU0_INT_STATUS))
    }

    pub fn clear_status(&self, ids: u32) {
        self.regs
            .write32(regs::sync_reg(sync::THRESH_CPU0_INT_STATUS), ids);
    }

    /// Disable everything and drop the shadow.
    pub fn reset(&mut self) {
        self.mask = [0; 2];
        self.flush(0);
        self.flush(1);
        self.clear_status(u32::MAX);
    }

    /// Write the shadow back after the host lost its registers.
    pub fn restore(&self) {
        self.flush(0);
        self.flush(1);
    }
}

const FAULT_HISTORY: usize = 16;

#[derive(Default)]
struct FaultInner {
    recent: VecDeque<BusFault>,
    total: u64,
}

/// Bus faults seen on the general line
#[derive(Default)]
pub struct FaultLog {
    inner: Mutex<FaultInner>,
}

impl FaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().unwrap().total
    }

    pub fn recent(&self) -> Vec<BusFault> {
        self.inner.lock().unwrap().recent.iter().copied().collect()
    }

    /// Decode and clear pending bus faults; returns how many were found.
    pub fn service(&self, regs: &dyn Mmio) -> usize {
        let mut inner = self.inner.lock().unwrap();
        Self::service_locked(&mut inner, regs)
    }

    /// Service pending faults, then report the latest one recorded
    /// after `since`.
    pub fn check_since(&self, regs: &dyn Mmio, since: u64) -> Option<BusFault> {
        let mut inner = self.inner.lock().unwrap();
        Self::service_locked(&mut inner, regs);
        if inner.total > since {
            inner.recent.back().copied()
        } else {
            None
        }
    }

    fn service_locked(inner: &mut FaultInner, regs: &dyn Mmio) -> usize {
        let status = regs.read32(regs::sync_reg(sync::HINTSTATUS));
        let ext = regs.read32(regs::sync_reg(sync::HINTSTATUS_EXT));
        let mut found = 0;

        for (bit, kind, addr_reg) in [
            (sync::EXT_IP_READ_INT, FaultKind::Read, sync::IP_READ_TIMEOUT_ADDR),
            (sync::EXT_IP_WRITE_INT, FaultKind::Write, sync::IP_WRITE_TIMEOUT_ADDR),
        ] {
            if ext & bit == 0 {
                continue;
            }
            let addr = regs.read32(regs::sync_reg(addr_reg));
            let fault = BusFault { kind, addr };
            kwarn!("{}", fault);
            if inner.recent.len() == FAULT_HISTORY {
                inner.recent.pop_front();
            }
            inner.recent.push_back(fault);
            inner.total += 1;
            found += 1;
        }

        if ext != 0 {
            regs.write32(regs::sync_reg(sync::HINTSTATUS_EXT), ext);
        }
        if status != 0 {
            regs.write32(regs::sync_reg(sync::HINTSTATUS), status);
        }
        found
    }
}

/// Power-down timeout for the granted host clock. Slower clocks stretch
/// the timeout so modules are not cycled while work is still draining.
pub fn scaled_timeout(granted_khz: u32, default_khz: u32, fudge: u32, timeout: Duration) -> Duration {
    if granted_khz >= default_khz || granted_khz == 0 {
        return timeout;
    }
    let factor = default_khz.div_ceil(granted_khz);
    timeout * fudge * factor
}

/// One-time interrupt and timing setup after the host powers up.
pub fn init_host(regs: &dyn Mmio, granted_khz: u32) {
    regs.write32(regs::sync_reg(sync::IP_BUSY_TIMEOUT), 0);
    regs.write32(regs::sync_reg(sync::INTMASK), sync::INTMASK_CPU0_ALL);
    regs.write32(regs::sync_reg(sync::INTC0MASK), sync::INTC0MASK_HOST);
    regs.write32(regs::sync_reg(sync::HINTMASK), sync::HINTMASK_EXT_ENABLE);
    regs.write32(
        regs::sync_reg(sync::HINTMASK_EXT),
        sync::EXT_IP_READ_INT | sync::EXT_IP_WRITE_INT,
    );
    regs.write32(regs::sync_reg(sync::USEC_CLK), granted_khz.div_ceil(1000));
}
