//! `SimMemory` - allocator, pinning and CPU mappings in host RAM.
//!
//! Every allocation gets a fixed physical address from a bump
//! allocator so the simulated fetch unit can resolve descriptor
//! addresses back to buffer contents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use gfxhost_core::error::{HostResult, ResourceError};
use gfxhost_core::traits::MemoryManager;
use gfxhost_core::MemHandle;

/// First physical address handed out
pub const PHYS_BASE: u32 = 0x1000_0000;

struct Buffer {
    words: Vec<u32>,
    phys: u32,
    pins: u32,
    refs: u32,
}

#[derive(Default)]
struct MemState {
    buffers: HashMap<u32, Buffer>,
    /// phys base -> handle, for address lookups
    by_phys: BTreeMap<u32, u32>,
    next_handle: u32,
    next_phys: u32,
    fail_allocs: u32,
    poisoned: HashSet<u32>,
    pin_batches: u64,
}

pub struct SimMemory {
    state: Mutex<MemState>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                next_handle: 1,
                next_phys: PHYS_BASE,
                ..Default::default()
            }),
        }
    }

    /// Allocate a buffer and fill it with `words`.
    pub fn alloc_words(&self, words: &[u32]) -> HostResult<MemHandle> {
        let h = self.alloc((words.len().max(1) * 4) as u32, 16)?;
        let mut st = self.state.lock().unwrap();
        if let Some(buf) = st.buffers.get_mut(&h.as_u32()) {
            buf.words[..words.len()].copy_from_slice(words);
        }
        Ok(h)
    }

    /// Make the next `n` allocations fail.
    pub fn fail_next_allocs(&self, n: u32) {
        self.state.lock().unwrap().fail_allocs = n;
    }

    /// Make any pin batch containing `handle` fail.
    pub fn poison(&self, handle: MemHandle) {
        self.state.lock().unwrap().poisoned.insert(handle.as_u32());
    }

    pub fn unpoison(&self, handle: MemHandle) {
        self.state.lock().unwrap().poisoned.remove(&handle.as_u32());
    }

    pub fn pin_count(&self, handle: MemHandle) -> u32 {
        let st = self.state.lock().unwrap();
        st.buffers.get(&handle.as_u32()).map_or(0, |b| b.pins)
    }

    pub fn ref_count(&self, handle: MemHandle) -> u32 {
        let st = self.state.lock().unwrap();
        st.buffers.get(&handle.as_u32()).map_or(0, |b| b.refs)
    }

    /// Pins outstanding across every buffer
    pub fn total_pins(&self) -> u64 {
        let st = self.state.lock().unwrap();
        st.buffers.values().map(|b| b.pins as u64).sum()
    }

    pub fn total_refs(&self) -> u64 {
        let st = self.state.lock().unwrap();
        st.buffers.values().map(|b| b.refs as u64).sum()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    /// Successful `pin_multiple` calls so far
    pub fn pin_batches(&self) -> u64 {
        self.state.lock().unwrap().pin_batches
    }

    pub fn phys_of(&self, handle: MemHandle) -> Option<u32> {
        let st = self.state.lock().unwrap();
        st.buffers.get(&handle.as_u32()).map(|b| b.phys)
    }

    /// Read a word by physical address, as the device would.
    pub fn read_phys(&self, addr: u32) -> Option<u32> {
        let st = self.state.lock().unwrap();
        let (&base, &handle) = st.by_phys.range(..=addr).next_back()?;
        let buf = st.buffers.get(&handle)?;
        let idx = ((addr - base) / 4) as usize;
        buf.words.get(idx).copied()
    }

    /// Read `count` consecutive words by physical address.
    pub fn read_phys_range(&self, addr: u32, count: u32) -> Option<Vec<u32>> {
        (0..count).map(|i| self.read_phys(addr + i * 4)).collect()
    }
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager for SimMemory {
    fn alloc(&self, size: u32, align: u32) -> HostResult<MemHandle> {
        let mut st = self.state.lock().unwrap();
        if st.fail_allocs > 0 {
            st.fail_allocs -= 1;
            return Err(ResourceError::OutOfMemory.into());
        }
        let align = align.max(16);
        let phys = (st.next_phys + align - 1) & !(align - 1);
        let words = size.div_ceil(4).max(1);
        st.next_phys = phys
            .checked_add(words * 4)
            .ok_or(ResourceError::OutOfMemory)?;

        let h = st.next_handle;
        st.next_handle += 1;
        st.buffers.insert(
            h,
            Buffer { words: vec![0; words as usize], phys, pins: 0, refs: 1 },
        );
        st.by_phys.insert(phys, h);
        Ok(MemHandle::new(h))
    }

    fn free(&self, handle: MemHandle) {
        let mut st = self.state.lock().unwrap();
        if let Some(buf) = st.buffers.get_mut(&handle.as_u32()) {
            debug_assert_eq!(buf.pins, 0, "freeing pinned {}", handle);
            buf.refs = buf.refs.saturating_sub(1);
            if buf.refs == 0 {
                let phys = buf.phys;
                st.buffers.remove(&handle.as_u32());
                st.by_phys.remove(&phys);
            }
        }
    }

    fn pin_multiple(&self, handles: &[MemHandle], phys: &mut [u32]) -> HostResult<()> {
        debug_assert!(phys.len() >= handles.len());
        let mut st = self.state.lock().unwrap();
        for h in handles {
            if st.poisoned.contains(&h.as_u32()) || !st.buffers.contains_key(&h.as_u32()) {
                return Err(ResourceError::PinFailed.into());
            }
        }
        for (h, out) in handles.iter().zip(phys.iter_mut()) {
            if let Some(buf) = st.buffers.get_mut(&h.as_u32()) {
                buf.pins += 1;
                *out = buf.phys;
            }
        }
        st.pin_batches += 1;
        Ok(())
    }

    fn unpin_multiple(&self, handles: &[MemHandle]) {
        let mut st = self.state.lock().unwrap();
        for h in handles {
            if let Some(buf) = st.buffers.get_mut(&h.as_u32()) {
                debug_assert!(buf.pins > 0, "unpin of unpinned {}", h);
                buf.pins = buf.pins.saturating_sub(1);
            }
        }
    }

    fn incr_ref(&self, handle: MemHandle) {
        let mut st = self.state.lock().unwrap();
        if let Some(buf) = st.buffers.get_mut(&handle.as_u32()) {
            buf.refs += 1;
        }
    }

    fn decr_ref(&self, handle: MemHandle) {
        let mut st = self.state.lock().unwrap();
        if let Some(buf) = st.buffers.get_mut(&handle.as_u32()) {
            debug_assert!(buf.refs > 0);
            buf.refs = buf.refs.saturating_sub(1);
            if buf.refs == 0 {
                let phys = buf.phys;
                st.buffers.remove(&handle.as_u32());
                st.by_phys.remove(&phys);
            }
        }
    }

    fn read32(&self, handle: MemHandle, offset: u32) -> u32 {
        let st = self.state.lock().unwrap();
        st.buffers
            .get(&handle.as_u32())
            .and_then(|b| b.words.get((offset / 4) as usize).copied())
            .unwrap_or(0)
    }

    fn write32(&self, handle: MemHandle, offset: u32, value: u32) {
        let mut st = self.state.lock().unwrap();
        if let Some(w) = st
            .buffers
            .get_mut(&handle.as_u32())
            .and_then(|b| b.words.get_mut((offset / 4) as usize))
        {
            *w = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_assigns_distinct_aligned_phys() {
        let mem = SimMemory::new();
        let a = mem.alloc(12, 16).unwrap();
        let b = mem.alloc(4, 64).unwrap();
        let pa = mem.phys_of(a).unwrap();
        let pb = mem.phys_of(b).unwrap();
        assert_eq!(pa, PHYS_BASE);
        assert_eq!(pb % 64, 0);
        assert!(pb >= pa + 12);
    }

    #[test]
    fn test_pin_batch_is_atomic() {
        let mem = SimMemory::new();
        let a = mem.alloc(4, 16).unwrap();
        let b = mem.alloc(4, 16).unwrap();
        mem.poison(b);
        let mut phys = [0u32; 2];
        assert!(mem.pin_multiple(&[a, b], &mut phys).is_err());
        assert_eq!(mem.pin_count(a), 0);
        assert_eq!(mem.pin_count(b), 0);

        mem.unpoison(b);
        mem.pin_multiple(&[a, b, a], &mut [0u32; 3]).unwrap();
        assert_eq!(mem.pin_count(a), 2);
        mem.unpin_multiple(&[a, b, a]);
        assert_eq!(mem.total_pins(), 0);
    }

    #[test]
    fn test_read_phys_resolves_buffer() {
        let mem = SimMemory::new();
        let _pad = mem.alloc(64, 16).unwrap();
        let h = mem.alloc_words(&[1, 2, 3]).unwrap();
        let base = mem.phys_of(h).unwrap();
        assert_eq!(mem.read_phys(base + 4), Some(2));
        assert_eq!(mem.read_phys_range(base, 3), Some(vec![1, 2, 3]));
        assert_eq!(mem.read_phys(base + 12), None);
    }

    #[test]
    fn test_refs_free_on_last_drop() {
        let mem = SimMemory::new();
        let h = mem.alloc(4, 16).unwrap();
        mem.incr_ref(h);
        mem.free(h);
        assert_eq!(mem.live_allocations(), 1);
        mem.decr_ref(h);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_alloc_failure_injection() {
        let mem = SimMemory::new();
        mem.fail_next_allocs(1);
        assert!(mem.alloc(4, 16).is_err());
        assert!(mem.alloc(4, 16).is_ok());
    }
}
