//! Submission descriptions
//!
//! What a client hands to `Host::submit`: the command segments to
//! gather, the relocations to patch into them once their targets are
//! pinned, and the completion counter the work advances.

use gfxhost_core::error::{HostError, HostResult};
use gfxhost_core::opcode::GATHER_MAX_WORDS;
use gfxhost_core::{ContextId, CounterId, MemHandle};

/// A region of a command buffer the fetch unit gathers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub mem: MemHandle,
    /// Byte offset into `mem`
    pub offset: u32,
    pub words: u32,
}

impl Segment {
    pub const fn new(mem: MemHandle, offset: u32, words: u32) -> Self {
        Segment { mem, offset, words }
    }
}

/// Patch the physical address of `target` into a command buffer word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub cmdbuf: MemHandle,
    /// Byte offset of the patched word inside `cmdbuf`
    pub cmdbuf_offset: u32,
    pub target: MemHandle,
    pub target_offset: u32,
    /// Right shift applied to the address before patching
    pub shift: u32,
}

impl Relocation {
    pub const fn new(
        cmdbuf: MemHandle,
        cmdbuf_offset: u32,
        target: MemHandle,
        target_offset: u32,
    ) -> Self {
        Relocation { cmdbuf, cmdbuf_offset, target, target_offset, shift: 0 }
    }

    pub const fn with_shift(mut self, shift: u32) -> Self {
        self.shift = shift;
        self
    }

    /// Value written into the command buffer
    #[inline]
    pub const fn patched(&self, target_phys: u32) -> u32 {
        target_phys.wrapping_add(self.target_offset) >> self.shift
    }
}

/// Where the submission leaves its completion counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterTarget {
    /// The work increments the counter `n` times
    Increment(u32),
    /// The counter reaches this value once the work retires
    Value(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub segments: &'a [Segment],
    pub relocs: &'a [Relocation],
    pub counter: CounterId,
    pub target: CounterTarget,
    /// Write no-op descriptors and complete the counter from the CPU
    pub null_kickoff: bool,
    /// Context the engine must hold while the segments run
    pub context: Option<ContextId>,
}

impl<'a> Submission<'a> {
    pub fn new(segments: &'a [Segment], counter: CounterId, target: CounterTarget) -> Self {
        Submission {
            segments,
            relocs: &[],
            counter,
            target,
            null_kickoff: false,
            context: None,
        }
    }

    pub fn relocs(mut self, relocs: &'a [Relocation]) -> Self {
        self.relocs = relocs;
        self
    }

    pub fn null_kickoff(mut self, enable: bool) -> Self {
        self.null_kickoff = enable;
        self
    }

    pub fn context(mut self, ctx: ContextId) -> Self {
        self.context = Some(ctx);
        self
    }

    pub(crate) fn validate(&self, max_handles: usize) -> HostResult<()> {
        if self.segments.is_empty() {
            return Err(HostError::InvalidArgument("submission has no segments"));
        }
        if self.segments.len() + self.relocs.len() > max_handles {
            return Err(HostError::InvalidArgument("too many handles in submission"));
        }
        if self
            .segments
            .iter()
            .any(|s| s.words == 0 || s.words > GATHER_MAX_WORDS || s.offset % 4 != 0)
        {
            return Err(HostError::InvalidArgument("malformed segment"));
        }
        if self.relocs.iter().any(|r| r.cmdbuf_offset % 4 != 0 || r.shift >= 32) {
            return Err(HostError::InvalidArgument("malformed relocation"));
        }
        Ok(())
    }
}
