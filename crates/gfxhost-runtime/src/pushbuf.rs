//! Push buffer
//!
//! Ring of `(opcode, address)` slots the fetch unit walks. One slot past
//! the nominal size holds a RESTART back to the base, so the hardware
//! wraps on its own. `fence` is the byte position below which slots are
//! free; the slot at `fence` itself is never written, which keeps a full
//! ring distinguishable from an empty one.

use std::sync::Arc;

use gfxhost_core::constants::SLOT_BYTES;
use gfxhost_core::error::HostResult;
use gfxhost_core::opcode;
use gfxhost_core::traits::MemoryManager;
use gfxhost_core::MemHandle;

pub struct PushBuffer {
    mem: Arc<dyn MemoryManager>,
    handle: MemHandle,
    phys: u32,
    size: u32,
    fence: u32,
    current: u32,
}

impl PushBuffer {
    /// Allocate, pin and terminate a ring of `size` bytes.
    pub fn alloc(mem: Arc<dyn MemoryManager>, size: u32) -> HostResult<Self> {
        debug_assert!(size.is_power_of_two());
        let handle = mem.alloc(size + SLOT_BYTES, 32)?;
        let phys = match mem.pin(handle) {
            Ok(p) => p,
            Err(e) => {
                mem.free(handle);
                return Err(e);
            }
        };
        mem.write32(handle, size, opcode::restart(phys));
        mem.write32(handle, size + 4, 0);

        let mut pb = PushBuffer {
            mem,
            handle,
            phys,
            size,
            fence: 0,
            current: 0,
        };
        pb.reset();
        Ok(pb)
    }

    /// Rewind both positions to the base.
    pub fn reset(&mut self) {
        self.fence = self.size - SLOT_BYTES;
        self.current = 0;
    }

    /// Append one slot.
    pub fn push(&mut self, op: u32, addr: u32) {
        debug_assert_ne!(self.current, self.fence, "push buffer overrun");
        self.mem.write32(self.handle, self.current, op);
        self.mem.write32(self.handle, self.current + 4, addr);
        self.current = (self.current + SLOT_BYTES) & (self.size - 1);
    }

    /// Return `slots` retired slots to the free region.
    pub fn pop(&mut self, slots: u32) {
        debug_assert!(slots <= self.in_flight(), "retiring more slots than queued");
        self.fence = (self.fence + slots * SLOT_BYTES) & (self.size - 1);
    }

    /// Free slots
    pub fn space(&self) -> u32 {
        (self.fence.wrapping_sub(self.current) & (self.size - 1)) / SLOT_BYTES
    }

    /// Slots written and not yet retired
    pub fn in_flight(&self) -> u32 {
        self.capacity() - self.space()
    }

    /// Usable slots in an empty ring
    pub fn capacity(&self) -> u32 {
        self.size / SLOT_BYTES - 1
    }

    /// Value for DMAPUT after the last push
    pub fn put_addr(&self) -> u32 {
        self.phys + self.current
    }

    pub fn phys(&self) -> u32 {
        self.phys
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn fence(&self) -> u32 {
        self.fence
    }
}

impl Drop for PushBuffer {
    fn drop(&mut self) {
        self.mem.unpin(self.handle);
        self.mem.free(self.handle);
    }
}
