//! Collaborator traits
//!
//! The channel manager owns no hardware directly. Everything it touches
//! goes through these seams so the same code drives a mapped aperture
//! or the simulated accelerator in `gfxhost-hw`.

use std::sync::Arc;
use std::time::Instant;

use crate::error::HostResult;
use crate::id::{MemHandle, ModuleId};

/// 32-bit register access to the host aperture
///
/// Offsets are bytes from the aperture base (see [`crate::regs`]).
/// Implementations must perform exactly one bus access per call, in
/// program order.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Physical memory allocator and pinning primitive
///
/// **Contract:**
/// - `pin_multiple` is all-or-nothing: on error no handle in the batch
///   is left pinned.
/// - Pins and references are counted; every `pin_multiple` is paired
///   with exactly one `unpin_multiple` of the same handles.
/// - `read32`/`write32` go through a CPU mapping of the handle and may
///   be write-combined; call `flush_writes` before publishing them to
///   hardware.
pub trait MemoryManager: Send + Sync {
    /// Allocate `size` bytes aligned to `align`.
    fn alloc(&self, size: u32, align: u32) -> HostResult<MemHandle>;

    /// Drop the allocation. The handle must not be pinned.
    fn free(&self, handle: MemHandle);

    /// Pin a batch, writing each handle's physical address into `phys`.
    fn pin_multiple(&self, handles: &[MemHandle], phys: &mut [u32]) -> HostResult<()>;

    fn unpin_multiple(&self, handles: &[MemHandle]);

    /// Pin a single handle.
    fn pin(&self, handle: MemHandle) -> HostResult<u32> {
        let mut phys = [0u32; 1];
        self.pin_multiple(&[handle], &mut phys)?;
        Ok(phys[0])
    }

    fn unpin(&self, handle: MemHandle) {
        self.unpin_multiple(&[handle]);
    }

    /// Keep the handle alive while hardware may still reference it.
    fn incr_ref(&self, handle: MemHandle);

    fn decr_ref(&self, handle: MemHandle);

    fn read32(&self, handle: MemHandle, offset: u32) -> u32;

    fn write32(&self, handle: MemHandle, offset: u32, value: u32);

    /// Drain write-combining buffers so prior `write32`s are visible to
    /// the device.
    fn flush_writes(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Why the platform came back from suspend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeEvent {
    /// Registers were retained
    #[default]
    None,
    /// Deep sleep: everything behind the host lost power
    Lp0,
    /// Light sleep that still drops host state
    Lp1,
}

impl WakeEvent {
    /// Whether host registers must be restored from shadow state
    pub fn lost_state(self) -> bool {
        matches!(self, WakeEvent::Lp0 | WakeEvent::Lp1)
    }
}

/// Clock and rail control for the host and the modules behind it
pub trait PowerControl: Send + Sync {
    fn module_clock(&self, module: ModuleId, on: bool);

    fn module_voltage(&self, module: ModuleId, on: bool);

    /// Reason for the most recent resume
    fn wake_event(&self) -> WakeEvent;

    /// Request a host clock rate; returns the rate actually granted.
    fn set_host_clock_khz(&self, target_khz: u32) -> HostResult<u32>;
}

/// Wrapping millisecond clock
pub trait MonotonicClock: Send + Sync {
    fn now_ms(&self) -> u32;
}

/// `MonotonicClock` on top of `std::time::Instant`
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ms(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }
}

/// Interrupt lines the host raises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqLine {
    /// Counter threshold reached
    Syncpt,
    /// Bus timeouts and other general host faults
    General,
}

/// Interrupt handler. Runs in interrupt context: it must not block.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

pub trait IrqController: Send + Sync {
    fn register(&self, line: IrqLine, handler: IrqHandler) -> HostResult<()>;

    fn unregister(&self, line: IrqLine);
}

/// Direct register window of the modules behind the host
///
/// Only some platforms map module registers into the caller's address
/// space; the others reach them through the host's indirect port.
pub trait ModuleAperture: Send + Sync {
    fn read32(&self, module: ModuleId, offset: u32) -> u32;
    fn write32(&self, module: ModuleId, offset: u32, value: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_event_state_loss() {
        assert!(!WakeEvent::None.lost_state());
        assert!(WakeEvent::Lp0.lost_state());
        assert!(WakeEvent::Lp1.lost_state());
        assert_eq!(WakeEvent::default(), WakeEvent::None);
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(15));
        let b = clock.now_ms();
        assert!(b.wrapping_sub(a) >= 10);
    }
}
