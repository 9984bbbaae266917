//! Host state across deep sleep
//!
//! Counter values, thresholds, wait bases, channel classes and the
//! CPU-owner bit of every module mutex are copied to RAM before the
//! host is powered off. They are written back only when the wake
//! event reports that the registers were lost.
//!
//! Module mutexes live here too: they are plain host registers, and
//! restoring them is the only place the CPU takes one on its own.
//!
//! Every function expects the caller to hold a `ClockGuard`.

use std::hint;
use std::thread;

use gfxhost_core::constants::{MAX_CHANNELS, NB_COUNTERS, NB_MLOCKS, NB_WAIT_BASES};
use gfxhost_core::error::{HostError, HostResult};
use gfxhost_core::regs::{self, sync};
use gfxhost_core::traits::Mmio;
use gfxhost_core::CounterId;

const SPINS_BEFORE_YIELD: u32 = 64;

fn check_mlock(index: u32) -> HostResult<()> {
    if (index as usize) < NB_MLOCKS {
        Ok(())
    } else {
        Err(HostError::InvalidArgument("module mutex index out of range"))
    }
}

/// Take module mutex `index` for the CPU, spinning until it is free.
///
/// Reading the lock register acquires it when it reads back zero.
pub fn mlock_lock(regs: &dyn Mmio, index: u32) -> HostResult<()> {
    check_mlock(index)?;
    debug_assert!(
        regs.read32(regs::mlock_owner(index)) & sync::MLOCK_CPU_OWNS == 0,
        "cpu already owns mlock {}",
        index
    );
    let mut spins = 0u32;
    while regs.read32(regs::mlock(index)) != 0 {
        spins += 1;
        if spins % SPINS_BEFORE_YIELD == 0 {
            thread::yield_now();
        } else {
            hint::spin_loop();
        }
    }
    Ok(())
}

pub fn mlock_unlock(regs: &dyn Mmio, index: u32) -> HostResult<()> {
    check_mlock(index)?;
    regs.write32(regs::mlock(index), 0);
    Ok(())
}

/// Register snapshot taken on suspend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedState {
    counters: [u32; NB_COUNTERS],
    thresholds: [u32; NB_COUNTERS],
    bases: [u32; NB_WAIT_BASES],
    classes: [u32; MAX_CHANNELS],
    /// Bit `i` set when the CPU held mutex `i`
    cpu_mlocks: u32,
}

impl SavedState {
    pub fn save(regs: &dyn Mmio) -> Self {
        let mut s = SavedState {
            counters: [0; NB_COUNTERS],
            thresholds: [0; NB_COUNTERS],
            bases: [0; NB_WAIT_BASES],
            classes: [0; MAX_CHANNELS],
            cpu_mlocks: 0,
        };
        for id in 0..NB_COUNTERS {
            s.counters[id] = regs.read32(regs::syncpt(id as u32));
            s.thresholds[id] = regs.read32(regs::syncpt_int_thresh(id as u32));
        }
        for (i, base) in s.bases.iter_mut().enumerate() {
            *base = regs.read32(regs::syncpt_base(i as u32));
        }
        for (ch, class) in s.classes.iter_mut().enumerate() {
            let stat = regs.read32(regs::cbstat(ch as u32));
            *class = (stat >> sync::CBSTAT_CLASS_SHIFT) & sync::CBSTAT_CLASS_MASK;
        }
        for i in 0..NB_MLOCKS as u32 {
            if regs.read32(regs::mlock_owner(i)) & sync::MLOCK_CPU_OWNS != 0 {
                s.cpu_mlocks |= 1 << i;
            }
        }
        s
    }

    /// Write counters, thresholds and bases back, then put every module
    /// mutex in the state the CPU left it.
    pub fn restore(&self, regs: &dyn Mmio) -> HostResult<()> {
        for id in 0..NB_COUNTERS {
            regs.write32(regs::syncpt(id as u32), self.counters[id]);
            regs.write32(regs::syncpt_int_thresh(id as u32), self.thresholds[id]);
        }
        for (i, &base) in self.bases.iter().enumerate() {
            regs.write32(regs::syncpt_base(i as u32), base);
        }
        for i in 0..NB_MLOCKS as u32 {
            if self.cpu_mlocks & (1 << i) != 0 {
                mlock_lock(regs, i)?;
            } else {
                mlock_unlock(regs, i)?;
            }
        }
        Ok(())
    }

    pub fn counter(&self, id: CounterId) -> u32 {
        self.counters[id.as_usize()]
    }

    pub fn threshold(&self, id: CounterId) -> u32 {
        self.thresholds[id.as_usize()]
    }

    /// Class last selected on channel `ch`
    pub fn class_id(&self, ch: usize) -> u32 {
        self.classes[ch]
    }

    pub fn cpu_held_mlock(&self, index: u32) -> bool {
        self.cpu_mlocks & (1 << index) != 0
    }
}
