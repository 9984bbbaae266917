//! `MappedAperture` - register window mapped from a device node.
//!
//! Each access is a single volatile 32-bit load or store. The mapping
//! is opened with `O_SYNC` so the kernel hands back an uncached view.

use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};

use gfxhost_core::error::{HostError, HostResult, ResourceError};
use gfxhost_core::regs::bus_module_id;
use gfxhost_core::traits::{Mmio, ModuleAperture};
use gfxhost_core::{kdebug, ModuleId};

/// Spacing of module windows behind the host
pub const MODULE_STRIDE: u32 = 0x4_0000;

pub struct MappedAperture {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the mapping lives as long as the struct and every access is
// a single aligned volatile operation.
unsafe impl Send for MappedAperture {}
unsafe impl Sync for MappedAperture {}

impl MappedAperture {
    /// Map `len` bytes of `path` starting at `phys_base`.
    pub fn open(path: impl AsRef<Path>, phys_base: u64, len: usize) -> HostResult<Self> {
        let len_nz = NonZeroUsize::new(len).ok_or(HostError::InvalidArgument("empty aperture"))?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC | libc::O_CLOEXEC)
            .open(path.as_ref())
            .map_err(|_| HostError::NotSupported)?;

        let ptr = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                phys_base as libc::off_t,
            )
        }
        .map_err(|_| HostError::Exhausted(ResourceError::OutOfMemory))?;

        kdebug!(target: "hw", "mapped {} bytes at phys 0x{:x}", len, phys_base);
        Ok(Self { base: ptr.cast(), len })
    }

    /// Anonymous zeroed window, for running against plain memory.
    pub fn anonymous(len: usize) -> HostResult<Self> {
        let len_nz = NonZeroUsize::new(len).ok_or(HostError::InvalidArgument("empty aperture"))?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|_| HostError::Exhausted(ResourceError::OutOfMemory))?;
        Ok(Self { base: ptr.cast(), len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    fn slot(&self, offset: u32) -> *mut u32 {
        let offset = offset as usize;
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "register offset 0x{:x} out of window", offset);
        unsafe { self.base.as_ptr().add(offset) as *mut u32 }
    }
}

impl Mmio for MappedAperture {
    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        unsafe { std::ptr::read_volatile(self.slot(offset)) }
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        unsafe { std::ptr::write_volatile(self.slot(offset), value) }
    }
}

impl ModuleAperture for MappedAperture {
    fn read32(&self, module: ModuleId, offset: u32) -> u32 {
        match bus_module_id(module) {
            Some(id) => Mmio::read32(self, id * MODULE_STRIDE + offset),
            None => 0,
        }
    }

    fn write32(&self, module: ModuleId, offset: u32, value: u32) {
        if let Some(id) = bus_module_id(module) {
            Mmio::write32(self, id * MODULE_STRIDE + offset, value);
        }
    }
}

impl Drop for MappedAperture {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxhost_core::ModuleKind;

    #[test]
    fn test_anonymous_read_write() {
        let ap = MappedAperture::anonymous(0x4000).unwrap();
        assert_eq!(Mmio::read32(&ap, 0x18), 0);
        Mmio::write32(&ap, 0x18, 0xdead_beef);
        assert_eq!(Mmio::read32(&ap, 0x18), 0xdead_beef);
    }

    #[test]
    fn test_module_window() {
        let ap = MappedAperture::anonymous(16 * MODULE_STRIDE as usize).unwrap();
        let disp_b = ModuleId::new(ModuleKind::Display, 1);
        ModuleAperture::write32(&ap, disp_b, 0x10, 42);
        assert_eq!(Mmio::read32(&ap, 9 * MODULE_STRIDE + 0x10), 42);
        assert_eq!(ModuleAperture::read32(&ap, disp_b, 0x10), 42);
    }

    #[test]
    #[should_panic]
    fn test_out_of_window_panics() {
        let ap = MappedAperture::anonymous(0x100).unwrap();
        Mmio::read32(&ap, 0x100);
    }

    #[test]
    fn test_empty_rejected() {
        assert!(MappedAperture::anonymous(0).is_err());
        assert!(MappedAperture::open("/nonexistent/mem", 0, 0x1000).is_err());
    }
}
