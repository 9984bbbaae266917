//! Library defaults for `HostConfig`.

use gfxhost_core::constants::DEFAULT_CHANNELS;
use gfxhost_core::counter::reserved;

/// Channels managed (the last hardware channel belongs to the co-processor)
pub const NUM_CHANNELS: usize = DEFAULT_CHANNELS;

/// Push buffer bytes per channel (512 slots)
pub const PUSHBUFFER_SIZE: u32 = 4096;

/// Completion-queue words per channel
pub const SYNC_QUEUE_WORDS: u32 = 8192;

/// Command buffers plus relocations in one submission
pub const SUBMIT_MAX_HANDLES: usize = 1280;

/// Idle time before a module is powered down
pub const ACM_TIMEOUT_MS: u64 = 200;

/// Multiplier applied to the idle timeout on slow host clocks
pub const ACM_FUDGE: u32 = 2;

/// Host clock the idle timeout is calibrated for
pub const HOST_CLOCK_DEFAULT_KHZ: u32 = 83_000;

pub const RESERVED_COUNTERS: u32 = reserved::MASK;

pub const CLIENT_MANAGED_COUNTERS: u32 = reserved::CLIENT_MANAGED_MASK;

pub const POLL_MODE: bool = false;

/// Nodes per wait-list arena page
pub const WAIT_NODES_PER_PAGE: usize = 64;

/// Arena pages the wait list may grow to
pub const WAIT_LIST_MAX_PAGES: usize = 64;

/// Channel per module kind, indexed by `ModuleKind as usize`:
/// host, display, dsi, 2d, 3d, mpe, vi, isp
pub const AFFINITY: [u32; 8] = [0, 0, 6, 1, 2, 3, 4, 5];
