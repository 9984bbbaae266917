//! # gfxhost-core
//!
//! Core types and traits for the gfxhost command-channel manager.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Register backends live in `gfxhost-hw`, the manager itself in
//! `gfxhost-runtime`.
//!
//! ## Modules
//!
//! - `id` - Counter, channel, handle, context and module identifiers
//! - `counter` - Completion-counter arithmetic and the allocation mask
//! - `opcode` - Push-buffer descriptor encoding
//! - `regs` - Host register map
//! - `error` - Error types
//! - `traits` - Collaborator traits (MMIO, memory, power, clock, irq)
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod counter;
pub mod opcode;
pub mod regs;
pub mod error;
pub mod traits;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{ChannelId, ContextId, CounterId, MemHandle, ModuleId, ModuleKind};
pub use counter::{reached, CounterMask, Fence};
pub use opcode::Descriptor;
pub use error::{BusFault, ConfigError, FaultKind, HostError, HostResult, ResourceError};
pub use traits::{
    IrqController, IrqHandler, IrqLine, MemoryManager, Mmio, ModuleAperture, MonotonicClock,
    PowerControl, SystemClock, WakeEvent,
};
pub use env::{env_get, env_get_bool, env_get_mask, env_get_opt, env_get_str, env_is_set};

/// Hardware limits
pub mod constants {
    /// Hardware command channels
    pub const MAX_CHANNELS: usize = 8;

    /// Channels usable by this manager (one is left to the co-processor)
    pub const DEFAULT_CHANNELS: usize = MAX_CHANNELS - 1;

    /// Completion counters in the hardware namespace
    pub const NB_COUNTERS: usize = 32;

    /// Wait-base registers
    pub const NB_WAIT_BASES: usize = 8;

    /// Module mutexes (mlocks)
    pub const NB_MLOCKS: usize = 16;

    /// Bytes per push-buffer slot (opcode + address)
    pub const SLOT_BYTES: u32 = 8;

    /// Counter increments consumed by a context save on power-down
    pub const INCRS_FOR_CONTEXT_SAVE: u32 = 3;
}
