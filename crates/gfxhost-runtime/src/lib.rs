//! # gfxhost-runtime
//!
//! Command-channel manager for a shared graphics/media accelerator.
//!
//! This crate provides:
//! - Channels: push buffers, pin sets and completion queues
//! - Completion-counter shadows and CPU increments
//! - The wait list and its interrupt-driven worker
//! - Context save/restore insertion for shared engines
//! - The power scheduler (idle module shutdown) and suspend/resume
//! - Direct and indirect module register access
//! - `Host`, the context object tying it all together
//!
//! Hardware is reached only through the collaborator traits in
//! `gfxhost-core`; `gfxhost-hw` supplies a mapped aperture and a
//! simulated accelerator.

pub mod acm;
pub mod channel;
pub mod clock;
pub mod config;
pub mod context;
pub mod device;
pub mod host;
pub mod intr;
pub mod modregs;
pub mod pinset;
pub mod pushbuf;
pub mod semaphore;
pub mod submit;
pub mod suspend;
pub mod syncpt;
pub mod syncq;
pub mod waitlist;

// Re-exports
pub use acm::{AcmEntry, PowerStats};
pub use channel::{Channel, ChannelStats, QueueEvent};
pub use clock::{ClockGuard, HostClock};
pub use config::{HostConfig, RegisterPath};
pub use context::{ContextSpec, ContextState};
pub use device::Device;
pub use host::{ChannelHandle, Host};
pub use modregs::{DirectModuleRegisters, IndirectModuleRegisters, ModuleRegisters};
pub use pinset::{PinGuard, PinSet};
pub use semaphore::{new_semaphore, Semaphore};
pub use submit::{CounterTarget, Relocation, Segment, Submission};
pub use suspend::SavedState;
pub use waitlist::{WaitAction, WaitListStats};
