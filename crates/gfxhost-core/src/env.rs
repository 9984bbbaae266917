//! Environment variable utilities
//!
//! Typed lookups used by `HostConfig::from_env` and the logger.
//!
//! # Usage
//!
//! ```ignore
//! use gfxhost_core::env::{env_get, env_get_bool, env_get_mask};
//!
//! let channels: usize = env_get("GFXHOST_NUM_CHANNELS", 7);
//! let poll: bool = env_get_bool("GFXHOST_POLL_MODE", false);
//! let reserved: u32 = env_get_mask("GFXHOST_RESERVED_COUNTERS", 0x3f);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset variables and parse failures both yield `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as a 32-bit mask
///
/// Accepts decimal or `0x`-prefixed hexadecimal. Counter bitmasks are
/// usually written in hex.
#[inline]
pub fn env_get_mask(key: &str, default: u32) -> u32 {
    let Ok(val) = std::env::var(key) else {
        return default;
    };
    let val = val.trim();
    let parsed = match val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => val.parse().ok(),
    };
    parsed.unwrap_or(default)
}

/// Get environment variable as optional value
///
/// `Some(T)` only if the variable is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__GFXHOST_TEST_UNSET__", 7);
        assert_eq!(val, 7);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__GFXHOST_TEST_NUM__", " 4096 ");
        let val: u32 = env_get("__GFXHOST_TEST_NUM__", 0);
        assert_eq!(val, 4096);
        std::env::remove_var("__GFXHOST_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__GFXHOST_TEST_INVALID__", "lots");
        let val: usize = env_get("__GFXHOST_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__GFXHOST_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        assert!(env_get_bool("__GFXHOST_TEST_UNSET__", true));

        std::env::set_var("__GFXHOST_TEST_BOOL__", "ON");
        assert!(env_get_bool("__GFXHOST_TEST_BOOL__", false));

        std::env::set_var("__GFXHOST_TEST_BOOL__", "0");
        assert!(!env_get_bool("__GFXHOST_TEST_BOOL__", true));

        std::env::set_var("__GFXHOST_TEST_BOOL__", "garbage");
        assert!(!env_get_bool("__GFXHOST_TEST_BOOL__", true));

        std::env::remove_var("__GFXHOST_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_mask() {
        assert_eq!(env_get_mask("__GFXHOST_TEST_UNSET__", 0x3f), 0x3f);

        std::env::set_var("__GFXHOST_TEST_MASK__", "0x18");
        assert_eq!(env_get_mask("__GFXHOST_TEST_MASK__", 0), 0x18);

        std::env::set_var("__GFXHOST_TEST_MASK__", "24");
        assert_eq!(env_get_mask("__GFXHOST_TEST_MASK__", 0), 24);

        std::env::set_var("__GFXHOST_TEST_MASK__", "0xzz");
        assert_eq!(env_get_mask("__GFXHOST_TEST_MASK__", 5), 5);

        std::env::remove_var("__GFXHOST_TEST_MASK__");
    }

    #[test]
    fn test_env_get_opt_and_str() {
        let val: Option<u32> = env_get_opt("__GFXHOST_TEST_UNSET__");
        assert!(val.is_none());
        assert_eq!(env_get_str("__GFXHOST_TEST_UNSET__", "indirect"), "indirect");
        assert!(!env_is_set("__GFXHOST_TEST_UNSET__"));
        assert!(env_is_set("PATH"));
    }
}
