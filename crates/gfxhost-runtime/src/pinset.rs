//! Pin set
//!
//! Per-channel scratch space collecting the handles one submission
//! references: relocation targets first (adjacent runs of the same
//! handle collapse into one slot), then every command buffer. The set
//! is pinned in a single batch so an IOMMU-less platform never sees a
//! half-pinned submission.
//!
//! Pins are owned by a `PinGuard`. The guard releases them on drop,
//! which covers every error path between pinning and queueing. Once
//! queued, the handles move into the completion queue and come back as
//! a guard when the entry is drained.

use std::mem;
use std::sync::Arc;

use gfxhost_core::error::HostResult;
use gfxhost_core::traits::MemoryManager;
use gfxhost_core::MemHandle;

use crate::submit::{Relocation, Segment};

#[derive(Default)]
pub struct PinSet {
    handles: Vec<MemHandle>,
    phys: Vec<u32>,
    /// Relocation position -> slot in `handles`
    index: Vec<usize>,
    num_relocs: usize,
}

impl PinSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.handles.clear();
        self.index.clear();
        self.num_relocs = 0;
    }

    /// Collect relocation targets; returns the number of slots used.
    pub fn process_relocs(&mut self, relocs: &[Relocation]) -> usize {
        self.reset();
        for r in relocs {
            if self.handles.last() != Some(&r.target) {
                self.handles.push(r.target);
            }
            self.index.push(self.handles.len() - 1);
        }
        self.num_relocs = self.handles.len();
        self.num_relocs
    }

    /// Append each segment's buffer, one slot per segment.
    pub fn add_cmdbufs(&mut self, segments: &[Segment]) {
        self.handles.extend(segments.iter().map(|s| s.mem));
    }

    pub fn handles(&self) -> &[MemHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.handles.capacity()
    }

    /// Take a reference on every handle and pin them as one batch.
    pub fn pin_all(&mut self, mem: &Arc<dyn MemoryManager>) -> HostResult<PinGuard> {
        for &h in &self.handles {
            mem.incr_ref(h);
        }
        self.phys.resize(self.handles.len(), 0);
        if let Err(e) = mem.pin_multiple(&self.handles, &mut self.phys) {
            for &h in &self.handles {
                mem.decr_ref(h);
            }
            return Err(e);
        }
        Ok(PinGuard {
            mem: Arc::clone(mem),
            handles: self.handles.clone(),
        })
    }

    /// Physical address of relocation `i`'s target
    pub fn reloc_phys(&self, i: usize) -> u32 {
        self.phys[self.index[i]]
    }

    /// Physical address of command buffer `i`
    pub fn cmdbuf_phys(&self, i: usize) -> u32 {
        self.phys[self.num_relocs + i]
    }

    /// Drop the grown capacity, on channel teardown.
    pub fn release(&mut self) {
        self.handles = Vec::new();
        self.phys = Vec::new();
        self.index = Vec::new();
        self.num_relocs = 0;
    }
}

/// Pinned and referenced handles, released exactly once
#[must_use = "dropping the guard unpins immediately"]
pub struct PinGuard {
    mem: Arc<dyn MemoryManager>,
    handles: Vec<MemHandle>,
}

impl PinGuard {
    /// Take ownership of handles pinned earlier.
    pub fn adopt(mem: Arc<dyn MemoryManager>, handles: Vec<MemHandle>) -> Self {
        PinGuard { mem, handles }
    }

    pub fn handles(&self) -> &[MemHandle] {
        &self.handles
    }

    /// Hand the handles to another owner without releasing them.
    pub fn into_handles(mut self) -> Vec<MemHandle> {
        mem::take(&mut self.handles)
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.mem.unpin_multiple(&self.handles);
        for &h in &self.handles {
            self.mem.decr_ref(h);
        }
    }
}
