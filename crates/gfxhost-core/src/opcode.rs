//! Push-buffer descriptor encoding
//!
//! Every ring slot holds two words, `(opcode, address)`. The fetch unit
//! decodes the opcode's top nibble. Only the handful of opcodes the
//! channel manager emits itself are modelled here, plus the two that
//! command streams use to bump completion counters.

use crate::constants::SLOT_BYTES;

const OP_SHIFT: u32 = 28;

pub const OP_SETCLASS: u32 = 0x0;
pub const OP_INCR: u32 = 0x1;
pub const OP_NONINCR: u32 = 0x2;
pub const OP_MASK: u32 = 0x3;
pub const OP_IMM: u32 = 0x4;
pub const OP_RESTART: u32 = 0x5;
pub const OP_GATHER: u32 = 0x6;

/// Largest word count a single gather can carry
pub const GATHER_MAX_WORDS: u32 = 0x3fff;

/// Host class method that increments a counter (`cond << 8 | id`)
pub const METHOD_INCR_SYNCPT: u32 = 0x00;

/// `INCR_SYNCPT` condition: increment as soon as the method is executed
pub const COND_IMMEDIATE: u32 = 0;
/// `INCR_SYNCPT` condition: increment once the engine is done with prior work
pub const COND_OP_DONE: u32 = 1;

/// Gather `words` 32-bit words from the descriptor's address.
#[inline]
pub const fn gather(words: u32) -> u32 {
    (OP_GATHER << OP_SHIFT) | (words & GATHER_MAX_WORDS)
}

/// Gather with an inserted method write: `insert` pushes `offset` ahead
/// of the data, `incr` walks the method offset per word.
#[inline]
pub const fn gather_insert(offset: u32, incr: bool, words: u32) -> u32 {
    (OP_GATHER << OP_SHIFT)
        | ((offset & 0xfff) << 16)
        | (1 << 15)
        | ((incr as u32) << 14)
        | (words & GATHER_MAX_WORDS)
}

/// Jump the fetch pointer back to `base` (16-byte aligned).
#[inline]
pub const fn restart(base: u32) -> u32 {
    (OP_RESTART << OP_SHIFT) | (base >> 4)
}

#[inline]
pub const fn setclass(offset: u32, class: u32, mask: u32) -> u32 {
    (OP_SETCLASS << OP_SHIFT) | ((offset & 0xfff) << 16) | ((class & 0x3ff) << 6) | (mask & 0x3f)
}

#[inline]
pub const fn incr(offset: u32, count: u32) -> u32 {
    (OP_INCR << OP_SHIFT) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

#[inline]
pub const fn nonincr(offset: u32, count: u32) -> u32 {
    (OP_NONINCR << OP_SHIFT) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

#[inline]
pub const fn mask(offset: u32, mask: u32) -> u32 {
    (OP_MASK << OP_SHIFT) | ((offset & 0xfff) << 16) | (mask & 0xffff)
}

#[inline]
pub const fn imm(offset: u32, value: u32) -> u32 {
    (OP_IMM << OP_SHIFT) | ((offset & 0xfff) << 16) | (value & 0xffff)
}

/// Single-word command that increments counter `id` under `cond`.
#[inline]
pub const fn incr_syncpt(cond: u32, id: u32) -> u32 {
    imm(METHOD_INCR_SYNCPT, ((cond & 0xff) << 8) | (id & 0xff))
}

/// Zero-length write. Slots written for a must-not-execute submission
/// carry this in both words.
pub const NOOP: u32 = nonincr(0, 0);

/// Top nibble of a command word
#[inline]
pub const fn opcode_of(word: u32) -> u32 {
    word >> OP_SHIFT
}

/// One ring slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub op: u32,
    pub addr: u32,
}

impl Descriptor {
    pub const BYTES: u32 = SLOT_BYTES;

    /// Fetch `words` from `addr`
    #[inline]
    pub const fn gather(addr: u32, words: u32) -> Self {
        Descriptor { op: gather(words), addr }
    }

    /// Slot that executes nothing
    #[inline]
    pub const fn noop() -> Self {
        Descriptor { op: NOOP, addr: NOOP }
    }

    /// The terminating jump back to the ring base. Only the first word
    /// is meaningful; the second is never fetched.
    #[inline]
    pub const fn restart(base: u32) -> Self {
        Descriptor { op: restart(base), addr: 0 }
    }

    #[inline]
    pub const fn words(self) -> [u32; 2] {
        [self.op, self.addr]
    }
}
