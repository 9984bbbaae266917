//! Collaborators the manager drives
//!
//! One `Device` bundles every seam: host registers, module windows,
//! memory, power, interrupts and time. Real platforms fill it with a
//! mapped aperture and platform services; tests use the simulation.

use std::sync::Arc;

use gfxhost_core::traits::{
    IrqController, MemoryManager, Mmio, ModuleAperture, MonotonicClock, PowerControl,
};

#[derive(Clone)]
pub struct Device {
    pub regs: Arc<dyn Mmio>,
    pub modules: Arc<dyn ModuleAperture>,
    pub mem: Arc<dyn MemoryManager>,
    pub power: Arc<dyn PowerControl>,
    pub irq: Arc<dyn IrqController>,
    pub clock: Arc<dyn MonotonicClock>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use gfxhost_hw::SimBackend;

    /// Device wired to a fresh simulated accelerator
    pub(crate) fn sim_device() -> (SimBackend, Device) {
        let sim = SimBackend::new();
        let dev = device_for(&sim);
        (sim, dev)
    }

    pub(crate) fn device_for(sim: &SimBackend) -> Device {
        Device {
            regs: sim.host.clone(),
            modules: sim.host.clone(),
            mem: sim.mem.clone(),
            power: sim.power.clone(),
            irq: sim.host.clone(),
            clock: sim.clock.clone(),
        }
    }
}
