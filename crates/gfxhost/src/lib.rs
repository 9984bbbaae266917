//! # gfxhost - command-channel manager
//!
//! Multiplexes command-buffer submissions from many client engines onto
//! the few command channels of a shared graphics/media accelerator,
//! tracks their completion through hardware counters, and powers idle
//! engines down.
//!
//! ## Quick Start
//!
//! ```ignore
//! use gfxhost::{CounterTarget, Host, HostConfig, ModuleId, ModuleKind, Submission};
//!
//! let host = Host::new(HostConfig::from_env(), device)?;
//! let ch = host.open(&[ModuleId::from(ModuleKind::Gr2d)])?;
//! let counter = host.counter_alloc()?;
//!
//! let fence = host.submit(&ch, &Submission::new(&segments, counter, CounterTarget::Increment(1)))?;
//! host.fence_wait(fence, Duration::from_millis(100))?;
//! host.close(ch);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     Client engines                         │
//! │          open(), submit(), fence_wait(), close()           │
//! └────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Host                              │
//! │   power lock -> channel submit lock -> push buffer / queue │
//! └────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Channels │      │ Wait list │      │   Power   │
//!    │ (fetch)   │◄─────│  worker   │      │  worker   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   ▲                   │
//!          ▼                   │ threshold irq     ▼
//!    ┌────────────────────────────────────────────────────────┐
//!    │      Accelerator: fetch unit, counters, modules        │
//!    └────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use gfxhost_core::{
    reached, BusFault, ChannelId, ConfigError, ContextId, CounterId, CounterMask, FaultKind, Fence,
    HostError, HostResult, MemHandle, ModuleId, ModuleKind, ResourceError, WakeEvent,
};
pub use gfxhost_core::{
    IrqController, IrqHandler, IrqLine, MemoryManager, Mmio, ModuleAperture, MonotonicClock,
    PowerControl, SystemClock,
};
pub use gfxhost_core::{constants, opcode, Descriptor};
pub use gfxhost_core::counter::reserved;

// Re-export kprint macros for debug logging
pub use gfxhost_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use gfxhost_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use gfxhost_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use gfxhost_runtime::{
    new_semaphore, AcmEntry, Channel, ChannelHandle, ChannelStats, ContextSpec, ContextState,
    CounterTarget, Device, Host, HostConfig, ModuleRegisters, PowerStats, RegisterPath, Relocation,
    Segment, Semaphore, Submission, WaitListStats,
};
pub use gfxhost_runtime::host::mlocks;

/// Simulated accelerator wiring, for tests and demos
#[cfg(feature = "sim")]
pub mod sim {
    pub use gfxhost_hw::{ManualClock, MlockOwner, PowerEvent, SimBackend, SimHost, SimMemory, SimPower};

    use gfxhost_runtime::Device;

    /// Device whose every collaborator is backed by `sim`
    pub fn device(sim: &SimBackend) -> Device {
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
