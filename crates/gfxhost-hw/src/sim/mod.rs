//! In-process simulation of the host and its collaborators.

mod clock;
mod host;
mod irq;
mod memory;
mod power;

use std::sync::Arc;

pub use clock::ManualClock;
pub use host::{MlockOwner, SimHost, MODULE_APERTURE_PHYS};
pub use memory::{SimMemory, PHYS_BASE};
pub use power::{PowerEvent, SimPower};

/// Host clock ceiling reported by `SimBackend::new`
pub const SIM_HOST_KHZ: u32 = 83_000;

/// One simulated platform: registers, memory, power rails and a clock.
pub struct SimBackend {
    pub host: Arc<SimHost>,
    pub mem: Arc<SimMemory>,
    pub power: Arc<SimPower>,
    pub clock: Arc<ManualClock>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::with_host_khz(SIM_HOST_KHZ)
    }

    pub fn with_host_khz(khz: u32) -> Self {
        let mem = Arc::new(SimMemory::new());
        let power = Arc::new(SimPower::new(khz));
        let host = Arc::new(SimHost::new(Arc::clone(&mem), Arc::clone(&power)));
        Self { host, mem, power, clock: Arc::new(ManualClock::new(0)) }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}
