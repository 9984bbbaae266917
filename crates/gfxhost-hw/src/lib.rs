//! # gfxhost-hw - register backends
//!
//! Implementations of the `gfxhost-core` collaborator traits.
//!
//! | Trait            | Real hardware     | Simulation   |
//! |------------------|-------------------|--------------|
//! | Mmio             | MappedAperture    | SimHost      |
//! | ModuleAperture   | MappedAperture    | SimHost      |
//! | IrqController    | (platform)        | SimHost      |
//! | MemoryManager    | (platform)        | SimMemory    |
//! | PowerControl     | (platform)        | SimPower     |
//! | MonotonicClock   | SystemClock       | ManualClock  |
//!
//! The simulation models the parts of the host the channel manager
//! depends on: the fetch unit walking the push buffer, completion
//! counters and their threshold interrupts, module mutexes, the
//! indirect register port and bus-timeout faults.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod aperture;
        pub use aperture::MappedAperture;
    }
}

pub mod sim;

pub use sim::{ManualClock, MlockOwner, PowerEvent, SimBackend, SimHost, SimMemory, SimPower};
