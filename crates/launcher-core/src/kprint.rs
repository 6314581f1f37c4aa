//! Leveled stderr logging.
//!
//! One locked write per line, so lines from the service loop and from a
//! failing launch never interleave mid-line.
//!
//! # Environment Variables
//!
//! - `LAUNCHER_LOG_LEVEL=<level>`: `off|error|warn|info|debug|trace` or `0..5`
//!   (default `info`)
//! - `LAUNCHER_FLUSH_EPRINT=1`: flush stderr after every line
//!
//! ```ignore
//! use launcher_core::{kerror, kinfo};
//!
//! kinfo!("listening on {}", path);
//! kerror!("AddArgs: {}", err);
//! ```

use std::io::Write;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::env::env_get_bool;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; `None` for anything unrecognized.
    pub fn parse(s: &str) -> Option<Self> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "warning" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => return None,
        };
        Some(level)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

static INIT: Once = Once::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);

/// Read `LAUNCHER_LOG_LEVEL` / `LAUNCHER_FLUSH_EPRINT`. Runs once; later
/// calls are no-ops, and the first log line triggers it implicitly.
pub fn init() {
    INIT.call_once(|| {
        if let Some(level) = std::env::var("LAUNCHER_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
        {
            LOG_LEVEL.store(level as u8, Ordering::Relaxed);
        }
        FLUSH.store(env_get_bool("LAUNCHER_FLUSH_EPRINT", false), Ordering::Relaxed);
    });
}

#[inline]
pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Override the level (tests, `-v` style flags). Wins over the environment.
pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = write!(out, "launcher[{}]: ", level.tag());
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}
