//! Error types for the gfxhost command-channel manager

use core::fmt;

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Errors surfaced by host operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Allocation, pin or namespace exhaustion. Never retried internally.
    Exhausted(ResourceError),

    /// A bounded wait on a counter threshold expired
    Timeout { counter: u32, threshold: u32 },

    /// A module behind the host did not answer within the bus timeout
    BusFault(BusFault),

    /// Caller passed something the host cannot act on
    InvalidArgument(&'static str),

    /// Operation is not valid in the current host or channel state
    InvalidState(&'static str),

    /// No context, channel or device is set up for this operation
    NotInitialized,

    /// The backend lacks the requested capability
    NotSupported,

    /// The host is being torn down
    ShuttingDown,

    /// Configuration rejected at init
    Config(ConfigError),

    /// A worker thread could not be spawned
    Spawn(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Exhausted(e) => write!(f, "resource exhausted: {}", e),
            HostError::Timeout { counter, threshold } => {
                write!(f, "timed out waiting for counter {} to reach {}", counter, threshold)
            }
            HostError::BusFault(e) => write!(f, "bus fault: {}", e),
            HostError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            HostError::InvalidState(what) => write!(f, "invalid state: {}", what),
            HostError::NotInitialized => write!(f, "not initialized"),
            HostError::NotSupported => write!(f, "operation not supported"),
            HostError::ShuttingDown => write!(f, "host is shutting down"),
            HostError::Config(e) => write!(f, "{}", e),
            HostError::Spawn(msg) => write!(f, "failed to spawn worker: {}", msg),
        }
    }
}

impl std::error::Error for HostError {}

/// Resource exhaustion causes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// Push buffer, pin set or handle memory could not be allocated
    OutOfMemory,

    /// The memory manager refused to pin the batch
    PinFailed,

    /// Every non-reserved counter is in use
    NoFreeCounter,

    /// The wait-list arena could not grow
    WaitListFull,

    /// The context table is full
    NoFreeContext,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::OutOfMemory => write!(f, "out of memory"),
            ResourceError::PinFailed => write!(f, "pinning failed"),
            ResourceError::NoFreeCounter => write!(f, "no free completion counter"),
            ResourceError::WaitListFull => write!(f, "wait list full"),
            ResourceError::NoFreeContext => write!(f, "no free context slot"),
        }
    }
}

impl From<ResourceError> for HostError {
    fn from(e: ResourceError) -> Self {
        HostError::Exhausted(e)
    }
}

/// Direction of a timed-out module access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

/// A module access that timed out on the host bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault {
    pub kind: FaultKind,
    pub addr: u32,
}

impl fmt::Display for BusFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.kind {
            FaultKind::Read => "read",
            FaultKind::Write => "write",
        };
        write!(f, "{} timed out at 0x{:08x}", dir, self.addr)
    }
}

impl From<BusFault> for HostError {
    fn from(e: BusFault) -> Self {
        HostError::BusFault(e)
    }
}

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for HostError {
    fn from(e: ConfigError) -> Self {
        HostError::Config(e)
    }
}
