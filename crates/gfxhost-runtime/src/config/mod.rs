//! Host configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use gfxhost_runtime::config::{HostConfig, RegisterPath};
//!
//! let config = HostConfig::from_env()
//!     .pushbuffer_size(8192)
//!     .register_path(RegisterPath::Direct);
//! config.validate()?;
//! ```

pub mod defaults;

use std::str::FromStr;
use std::time::Duration;

use gfxhost_core::constants::{MAX_CHANNELS, SLOT_BYTES};
use gfxhost_core::env::{env_get, env_get_bool, env_get_mask, env_get_str};
pub use gfxhost_core::error::ConfigError;
use gfxhost_core::{ChannelId, ModuleKind};

use crate::syncq::MIN_ENTRY;

/// How module registers behind the host are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterPath {
    /// Mapped module windows
    Direct,
    /// The host's indirect port on the protected channel
    #[default]
    Indirect,
}

impl FromStr for RegisterPath {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(RegisterPath::Direct),
            "indirect" => Ok(RegisterPath::Indirect),
            _ => Err(()),
        }
    }
}

/// Channel manager configuration with builder pattern.
///
/// Use `from_env()` to start with library defaults and apply any
/// environment variable overrides.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Channels managed, counted from channel 0
    pub num_channels: usize,
    /// Push buffer bytes per channel (power of two)
    pub pushbuffer_size: u32,
    /// Completion-queue words per channel
    pub sync_queue_words: u32,
    /// Command buffers plus relocations per submission
    pub submit_max_handles: usize,
    /// Idle time before a module is powered down
    pub acm_timeout: Duration,
    /// Idle timeout multiplier on slow host clocks
    pub acm_fudge: u32,
    /// Host clock the idle timeout is calibrated for
    pub host_clock_default_khz: u32,
    /// Counters never handed out by `counter_alloc`
    pub reserved_counters: u32,
    /// Counters whose submission targets are absolute values
    pub client_managed_counters: u32,
    pub register_path: RegisterPath,
    /// Channel per module kind, indexed by `ModuleKind as usize`
    pub affinity: [u32; 8],
    /// Poll counters instead of arming threshold interrupts
    pub poll_mode: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl HostConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `GFXHOST_NUM_CHANNELS` - Channels managed
    /// - `GFXHOST_PUSHBUFFER_SIZE` - Push buffer bytes per channel
    /// - `GFXHOST_SYNC_QUEUE_WORDS` - Completion-queue words per channel
    /// - `GFXHOST_SUBMIT_MAX_HANDLES` - Handles per submission
    /// - `GFXHOST_ACM_TIMEOUT_MS` - Module idle timeout in milliseconds
    /// - `GFXHOST_ACM_FUDGE` - Idle timeout multiplier on slow clocks
    /// - `GFXHOST_HOST_CLOCK_KHZ` - Calibration host clock
    /// - `GFXHOST_RESERVED_COUNTERS` - Reserved counter mask (hex ok)
    /// - `GFXHOST_CLIENT_MANAGED_COUNTERS` - Client-managed counter mask
    /// - `GFXHOST_REGISTER_PATH` - direct / indirect
    /// - `GFXHOST_POLL_MODE` - Poll instead of interrupts (0/1)
    pub fn from_env() -> Self {
        Self {
            num_channels: env_get("GFXHOST_NUM_CHANNELS", defaults::NUM_CHANNELS),
            pushbuffer_size: env_get("GFXHOST_PUSHBUFFER_SIZE", defaults::PUSHBUFFER_SIZE),
            sync_queue_words: env_get("GFXHOST_SYNC_QUEUE_WORDS", defaults::SYNC_QUEUE_WORDS),
            submit_max_handles: env_get(
                "GFXHOST_SUBMIT_MAX_HANDLES",
                defaults::SUBMIT_MAX_HANDLES,
            ),
            acm_timeout: Duration::from_millis(env_get(
                "GFXHOST_ACM_TIMEOUT_MS",
                defaults::ACM_TIMEOUT_MS,
            )),
            acm_fudge: env_get("GFXHOST_ACM_FUDGE", defaults::ACM_FUDGE),
            host_clock_default_khz: env_get(
                "GFXHOST_HOST_CLOCK_KHZ",
                defaults::HOST_CLOCK_DEFAULT_KHZ,
            ),
            reserved_counters: env_get_mask(
                "GFXHOST_RESERVED_COUNTERS",
                defaults::RESERVED_COUNTERS,
            ),
            client_managed_counters: env_get_mask(
                "GFXHOST_CLIENT_MANAGED_COUNTERS",
                defaults::CLIENT_MANAGED_COUNTERS,
            ),
            register_path: env_get_str("GFXHOST_REGISTER_PATH", "indirect")
                .parse()
                .unwrap_or_default(),
            affinity: defaults::AFFINITY,
            poll_mode: env_get_bool("GFXHOST_POLL_MODE", defaults::POLL_MODE),
        }
    }

    /// Create config with library defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            num_channels: defaults::NUM_CHANNELS,
            pushbuffer_size: defaults::PUSHBUFFER_SIZE,
            sync_queue_words: defaults::SYNC_QUEUE_WORDS,
            submit_max_handles: defaults::SUBMIT_MAX_HANDLES,
            acm_timeout: Duration::from_millis(defaults::ACM_TIMEOUT_MS),
            acm_fudge: defaults::ACM_FUDGE,
            host_clock_default_khz: defaults::HOST_CLOCK_DEFAULT_KHZ,
            reserved_counters: defaults::RESERVED_COUNTERS,
            client_managed_counters: defaults::CLIENT_MANAGED_COUNTERS,
            register_path: RegisterPath::default(),
            affinity: defaults::AFFINITY,
            poll_mode: defaults::POLL_MODE,
        }
    }

    // Builder methods

    pub fn num_channels(mut self, n: usize) -> Self {
        self.num_channels = n;
        self
    }

    pub fn pushbuffer_size(mut self, bytes: u32) -> Self {
        self.pushbuffer_size = bytes;
        self
    }

    pub fn sync_queue_words(mut self, words: u32) -> Self {
        self.sync_queue_words = words;
        self
    }

    pub fn submit_max_handles(mut self, n: usize) -> Self {
        self.submit_max_handles = n;
        self
    }

    pub fn acm_timeout(mut self, d: Duration) -> Self {
        self.acm_timeout = d;
        self
    }

    pub fn acm_fudge(mut self, fudge: u32) -> Self {
        self.acm_fudge = fudge;
        self
    }

    pub fn host_clock_default_khz(mut self, khz: u32) -> Self {
        self.host_clock_default_khz = khz;
        self
    }

    pub fn reserved_counters(mut self, mask: u32) -> Self {
        self.reserved_counters = mask;
        self
    }

    pub fn client_managed_counters(mut self, mask: u32) -> Self {
        self.client_managed_counters = mask;
        self
    }

    pub fn register_path(mut self, path: RegisterPath) -> Self {
        self.register_path = path;
        self
    }

    pub fn affinity(mut self, kind: ModuleKind, channel: u32) -> Self {
        self.affinity[kind as usize] = channel;
        self
    }

    pub fn poll_mode(mut self, enable: bool) -> Self {
        self.poll_mode = enable;
        self
    }

    /// Channel a module kind is routed to
    pub fn channel_for(&self, kind: ModuleKind) -> ChannelId {
        ChannelId::new(self.affinity[kind as usize])
    }

    /// Push buffer capacity in slots
    pub fn pushbuffer_slots(&self) -> u32 {
        self.pushbuffer_size / SLOT_BYTES
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_channels == 0 {
            return Err(ConfigError::InvalidValue("num_channels must be > 0"));
        }
        if self.num_channels > MAX_CHANNELS {
            return Err(ConfigError::InvalidValue("num_channels must be <= 8"));
        }
        if !self.pushbuffer_size.is_power_of_two() || self.pushbuffer_size < 32 {
            return Err(ConfigError::InvalidValue(
                "pushbuffer_size must be a power of two >= 32",
            ));
        }
        if self.sync_queue_words < 2 * MIN_ENTRY {
            return Err(ConfigError::InvalidValue(
                "sync_queue_words must hold two minimum entries",
            ));
        }
        if self.submit_max_handles == 0 {
            return Err(ConfigError::InvalidValue("submit_max_handles must be > 0"));
        }
        if self.acm_fudge == 0 {
            return Err(ConfigError::InvalidValue("acm_fudge must be > 0"));
        }
        if self.host_clock_default_khz == 0 {
            return Err(ConfigError::InvalidValue("host_clock_default_khz must be > 0"));
        }
        if self.affinity.iter().any(|&ch| ch as usize >= self.num_channels) {
            return Err(ConfigError::InvalidValue(
                "every affinity target must be < num_channels",
            ));
        }
        if self.client_managed_counters & !self.reserved_counters != 0 {
            return Err(ConfigError::InvalidValue(
                "client_managed_counters must be a subset of reserved_counters",
            ));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("gfxhost configuration:");
        eprintln!("  num_channels:            {}", self.num_channels);
        eprintln!("  pushbuffer_size:         {}", self.pushbuffer_size);
        eprintln!("  sync_queue_words:        {}", self.sync_queue_words);
        eprintln!("  submit_max_handles:      {}", self.submit_max_handles);
        eprintln!("  acm_timeout:             {:?}", self.acm_timeout);
        eprintln!("  acm_fudge:               {}", self.acm_fudge);
        eprintln!("  host_clock_default_khz:  {}", self.host_clock_default_khz);
        eprintln!("  reserved_counters:       0x{:08x}", self.reserved_counters);
        eprintln!("  client_managed_counters: 0x{:08x}", self.client_managed_counters);
        eprintln!("  register_path:           {:?}", self.register_path);
        eprintln!("  affinity:                {:?}", self.affinity);
        eprintln!("  poll_mode:               {}", self.poll_mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        let config = HostConfig::from_env();
        assert!(config.num_channels >= 1);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.pushbuffer_slots(), 512);
        assert_eq!(config.channel_for(ModuleKind::Display), ChannelId::new(0));
        assert_eq!(config.channel_for(ModuleKind::Dsi), ChannelId::new(6));
    }

    #[test]
    fn test_builder() {
        let config = HostConfig::new()
            .pushbuffer_size(8192)
            .register_path(RegisterPath::Direct)
            .affinity(ModuleKind::Gr2d, 3)
            .poll_mode(true);

        assert_eq!(config.pushbuffer_size, 8192);
        assert_eq!(config.register_path, RegisterPath::Direct);
        assert_eq!(config.channel_for(ModuleKind::Gr2d), ChannelId::new(3));
        assert!(config.poll_mode);
    }

    #[test]
    fn test_validation() {
        assert!(HostConfig::new().pushbuffer_size(3000).validate().is_err());
        assert!(HostConfig::new().pushbuffer_size(16).validate().is_err());
        assert!(HostConfig::new().num_channels(9).validate().is_err());
        assert!(HostConfig::new().sync_queue_words(9).validate().is_err());
        assert!(HostConfig::new().submit_max_handles(0).validate().is_err());
        // dsi is routed to channel 6
        assert!(HostConfig::new().num_channels(6).validate().is_err());
        assert!(HostConfig::new()
            .reserved_counters(0x1)
            .client_managed_counters(0x2)
            .validate()
            .is_err());
    }

    #[test]
    fn test_register_path_parse() {
        assert_eq!("Direct".parse(), Ok(RegisterPath::Direct));
        assert_eq!(" indirect ".parse(), Ok(RegisterPath::Indirect));
        assert!("mmio".parse::<RegisterPath>().is_err());
    }
}
