//! Environment lookups with typed defaults.
//!
//! Every tunable in the launcher is an optional `LAUNCHER_*` variable.
//! A variable that is unset or fails to parse falls back to the compiled
//! default, so a typo never prevents the service from starting.
//!
//! ```ignore
//! use launcher_core::env::{env_get, env_get_bool, env_get_str};
//!
//! let batch: usize = env_get("LAUNCHER_MAX_BATCH", 64);
//! let path = env_get_str("LAUNCHER_SOCKET", "/tmp/launcher.sock");
//! let flush = env_get_bool("LAUNCHER_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default` when unset or malformed.
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

/// Boolean flag: "1", "true", "yes" and "on" (any case) are true.
///
/// A set-but-unrecognized value counts as false; only an unset variable
/// yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => parse_bool(&val),
        Err(_) => default,
    }
}

/// String value, or `default` when unset or empty.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => default.to_string(),
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
