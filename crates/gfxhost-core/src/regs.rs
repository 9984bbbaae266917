//! Host register map
//!
//! Byte offsets into the host aperture. Channel `n`'s registers sit at
//! `n * CHANNEL_STRIDE`; the sync block (counters, interrupts, mlocks)
//! sits at `SYNC_BASE` inside channel 0's window.

use crate::constants::NB_COUNTERS;
use crate::id::{ModuleId, ModuleKind};

pub const CHANNEL_STRIDE: u32 = 0x4000;
pub const SYNC_BASE: u32 = 0x3000;

/// Channel used for indirect module register access
pub const INDIRECT_CHANNEL: u32 = 7;

/// Per-channel registers (offset within the channel window)
pub mod channel {
    pub const FIFOSTAT: u32 = 0x00;
    pub const INDOFF: u32 = 0x0c;
    pub const INDCNT: u32 = 0x10;
    pub const DMASTART: u32 = 0x14;
    pub const DMAPUT: u32 = 0x18;
    pub const DMAGET: u32 = 0x1c;
    pub const DMAEND: u32 = 0x20;
    pub const DMACTRL: u32 = 0x24;
    pub const INDDATA: u32 = 0x3c;
}

pub mod dmactrl {
    pub const DMASTOP: u32 = 1 << 0;
    pub const DMAGETRST: u32 = 1 << 1;
    pub const DMAINITGET: u32 = 1 << 2;
}

pub mod fifostat {
    /// Free entries in the indirect write fifo
    pub const REGFNUMEMPTY_MASK: u32 = 0x3ff;
    pub const CFEMPTY: u32 = 1 << 10;
    pub const OUTFENTRIES_SHIFT: u32 = 24;
    pub const OUTFENTRIES_MASK: u32 = 0x1f;

    #[inline]
    pub const fn free_write_entries(stat: u32) -> u32 {
        stat & REGFNUMEMPTY_MASK
    }

    #[inline]
    pub const fn read_entries(stat: u32) -> u32 {
        (stat >> OUTFENTRIES_SHIFT) & OUTFENTRIES_MASK
    }
}

pub mod indoff {
    pub const AUTOINC: u32 = 1 << 27;
    pub const MODID_SHIFT: u32 = 18;
    pub const MODID_MASK: u32 = 0xff;
    pub const ROFFSET_SHIFT: u32 = 2;
    pub const ROFFSET_MASK: u32 = 0xffff;
    /// Register access (as opposed to framebuffer)
    pub const ACCTYPE_REG: u32 = 0;

    /// INDOFF word for an auto-incrementing register access
    #[inline]
    pub const fn encode(modid: u32, word_offset: u32) -> u32 {
        AUTOINC
            | ACCTYPE_REG
            | ((modid & MODID_MASK) << MODID_SHIFT)
            | ((word_offset & ROFFSET_MASK) << ROFFSET_SHIFT)
    }

    #[inline]
    pub const fn modid(word: u32) -> u32 {
        (word >> MODID_SHIFT) & MODID_MASK
    }

    #[inline]
    pub const fn word_offset(word: u32) -> u32 {
        (word >> ROFFSET_SHIFT) & ROFFSET_MASK
    }
}

/// Sync block registers (offset from `SYNC_BASE`)
pub mod sync {
    pub const INTSTATUS: u32 = 0x000;
    pub const INTMASK: u32 = 0x004;
    pub const INTC0MASK: u32 = 0x008;
    pub const HINTSTATUS: u32 = 0x020;
    pub const HINTMASK: u32 = 0x024;
    pub const HINTSTATUS_EXT: u32 = 0x028;
    pub const HINTMASK_EXT: u32 = 0x02c;
    pub const THRESH_CPU0_INT_STATUS: u32 = 0x040;
    /// Two words, two bits per counter (CPU0, CPU1)
    pub const THRESH_INT_MASK: u32 = 0x060;
    pub const USEC_CLK: u32 = 0x1a4;
    pub const IP_BUSY_TIMEOUT: u32 = 0x1bc;
    pub const IP_READ_TIMEOUT_ADDR: u32 = 0x1c0;
    pub const IP_WRITE_TIMEOUT_ADDR: u32 = 0x1c4;
    pub const MLOCK: u32 = 0x2c0;
    pub const MLOCK_OWNER: u32 = 0x340;
    pub const CBSTAT: u32 = 0x3c0;
    pub const SYNCPT: u32 = 0x400;
    pub const SYNCPT_INT_THRESH: u32 = 0x500;
    pub const SYNCPT_BASE: u32 = 0x600;
    pub const SYNCPT_CPU_INCR: u32 = 0x700;

    pub const INTMASK_CPU0_ALL: u32 = 1 << 0;
    pub const INTC0MASK_HOST: u32 = 1 << 0;
    pub const HINTMASK_EXT_ENABLE: u32 = 1 << 30;
    pub const HINTSTATUS_EXT_PENDING: u32 = 1 << 30;
    pub const EXT_IP_READ_INT: u32 = 1 << 30;
    pub const EXT_IP_WRITE_INT: u32 = 1 << 31;

    pub const MLOCK_CH_OWNS: u32 = 1 << 0;
    pub const MLOCK_CPU_OWNS: u32 = 1 << 1;

    pub const CBSTAT_CLASS_SHIFT: u32 = 16;
    pub const CBSTAT_CLASS_MASK: u32 = 0x3ff;
}

/// Absolute offset of a channel register
#[inline]
pub const fn channel_reg(ch: u32, reg: u32) -> u32 {
    ch * CHANNEL_STRIDE + reg
}

/// Absolute offset of a sync register
#[inline]
pub const fn sync_reg(reg: u32) -> u32 {
    SYNC_BASE + reg
}

#[inline]
pub const fn syncpt(id: u32) -> u32 {
    sync_reg(sync::SYNCPT + id * 4)
}

#[inline]
pub const fn syncpt_int_thresh(id: u32) -> u32 {
    sync_reg(sync::SYNCPT_INT_THRESH + id * 4)
}

#[inline]
pub const fn syncpt_base(id: u32) -> u32 {
    sync_reg(sync::SYNCPT_BASE + id * 4)
}

/// CPU increment register for the 32-counter bank holding `id`
#[inline]
pub const fn syncpt_cpu_incr(id: u32) -> u32 {
    sync_reg(sync::SYNCPT_CPU_INCR + (id / NB_COUNTERS as u32) * 4)
}

#[inline]
pub const fn thresh_int_mask(word: u32) -> u32 {
    sync_reg(sync::THRESH_INT_MASK + word * 4)
}

#[inline]
pub const fn mlock(index: u32) -> u32 {
    sync_reg(sync::MLOCK + index * 4)
}

#[inline]
pub const fn mlock_owner(index: u32) -> u32 {
    sync_reg(sync::MLOCK_OWNER + index * 4)
}

#[inline]
pub const fn cbstat(ch: u32) -> u32 {
    sync_reg(sync::CBSTAT + ch * 4)
}

/// Module id on the host bus, as used by INDOFF
pub fn bus_module_id(module: ModuleId) -> Option<u32> {
    let id = match (module.kind, module.instance) {
        (ModuleKind::Host, _) => 0,
        (ModuleKind::Mpe, _) => 1,
        (ModuleKind::Vi, _) => 2,
        (ModuleKind::Isp, _) => 4,
        (ModuleKind::Gr2d, _) => 5,
        (ModuleKind::Gr3d, _) => 6,
        (ModuleKind::Display, 0) => 8,
        (ModuleKind::Display, 1) => 9,
        (ModuleKind::Dsi, 0) => 12,
        _ => return None,
    };
    Some(id)
}

/// Class id the command processor reports in CBSTAT for a module
pub fn class_id(kind: ModuleKind) -> u32 {
    match kind {
        ModuleKind::Host => 0x01,
        ModuleKind::Mpe => 0x20,
        ModuleKind::Vi => 0x30,
        ModuleKind::Isp => 0x32,
        ModuleKind::Gr2d => 0x51,
        ModuleKind::Gr3d => 0x60,
        ModuleKind::Display => 0x70,
        ModuleKind::Dsi => 0x77,
    }
}
