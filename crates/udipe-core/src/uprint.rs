//! Leveled debug printing for udipe
//!
//! Thread-safe, context-aware status output. Each line carries the log
//! level and the worker thread it originated from.
//!
//! # Environment Variables
//!
//! - `UDIPE_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `UDIPE_LOG_FLUSH=1` - Flush stderr after each line
//! - `UDIPE_LOG_TIME=1` - Include nanosecond timestamps
//!
//! # Output Format
//!
//! Without timestamp: `[LEVEL] [w<worker>] message`
//! With timestamp:    `[LEVEL] [<ns>] [w<worker>] message`

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use crate::env::env_get_bool;

/// Log levels
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

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

// Global configuration (initialized once)
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize logging from environment variables
///
/// Called automatically on first log; calling it explicitly makes the
/// initialization deterministic.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    START_TIME.get_or_init(Instant::now);

    FLUSH_ENABLED.store(env_get_bool("UDIPE_LOG_FLUSH", false), Ordering::Relaxed);
    TIME_ENABLED.store(env_get_bool("UDIPE_LOG_TIME", false), Ordering::Relaxed);

    if let Ok(val) = std::env::var("UDIPE_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
fn time_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    TIME_ENABLED.load(Ordering::Relaxed)
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Elapsed nanoseconds since logging started
#[inline]
pub fn elapsed_ns() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

thread_local! {
    static WORKER_ID: std::cell::Cell<Option<u32>> = const { std::cell::Cell::new(None) };
}

/// Set the current worker ID for this thread (called by the runtime)
pub fn set_worker_id(id: u32) {
    WORKER_ID.with(|w| w.set(Some(id)));
}

/// Clear the worker ID (called by the runtime on thread exit)
pub fn clear_worker_id() {
    WORKER_ID.with(|w| w.set(None));
}

/// Get the current worker ID
#[inline]
pub fn get_worker_id() -> Option<u32> {
    WORKER_ID.with(|w| w.get())
}

/// Internal: Leveled print with worker context
#[doc(hidden)]
pub fn _ulog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();

    let _ = write!(handle, "{} ", level.prefix());
    if time_enabled() {
        let _ = write!(handle, "[{}] ", elapsed_ns());
    }
    match get_worker_id() {
        Some(id) => {
            let _ = write!(handle, "[w{}] ", id);
        }
        None => {
            let _ = write!(handle, "[w--] ");
        }
    }
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");

    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Error level log with context
#[macro_export]
macro_rules! uerror {
    ($($arg:tt)*) => {{
        $crate::uprint::_ulog_impl(
            $crate::uprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log with context
#[macro_export]
macro_rules! uwarn {
    ($($arg:tt)*) => {{
        $crate::uprint::_ulog_impl(
            $crate::uprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log with context
#[macro_export]
macro_rules! uinfo {
    ($($arg:tt)*) => {{
        $crate::uprint::_ulog_impl(
            $crate::uprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log with context
#[macro_export]
macro_rules! udebug {
    ($($arg:tt)*) => {{
        $crate::uprint::_ulog_impl(
            $crate::uprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log with context
#[macro_export]
macro_rules! utrace {
    ($($arg:tt)*) => {{
        $crate::uprint::_ulog_impl(
            $crate::uprint::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}
