//! Environment variable helpers used by `ServerConfig::from_env()` and
//! the `cmd/` binaries.
//!
//! ```ignore
//! use ephttp_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let workers: usize = env_get("EPHTTP_WORKERS", 4);
//! let flush = env_get_bool("EPHTTP_FLUSH_EPRINT", false);
//! let grace = env_get_millis("EPHTTP_GRACE_MS", Some(Duration::from_secs(2)));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" (any case) are true; any other set value is false.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Milliseconds as an optional duration. A negative value means "no
/// timeout" and yields `None`.
pub fn env_get_millis(key: &str, default: Option<Duration>) -> Option<Duration> {
    match env_get_opt::<i64>(key) {
        Some(ms) if ms < 0 => None,
        Some(ms) => Some(Duration::from_millis(ms as u64)),
        None => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
