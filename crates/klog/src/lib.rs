//! Kernel logging subsystem.
//!
//! The kernel core is hardware-agnostic, so the output sink is installed
//! at boot by whoever owns the console (serial driver, framebuffer, a
//! test harness). Until `init()` runs, every log call is a no-op.
#![no_std]

use core::fmt;

use spin::Once;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }
}

/// The installed output sink. Receives the level and the pre-formatted
/// message arguments; the sink decides how to render them.
pub type Sink = fn(Level, fmt::Arguments);

/// One-shot sink storage. `Once` gives us lock-free reads after init,
/// which matters because logging happens inside spinlock critical sections.
static SINK: Once<Sink> = Once::new();

/// Initialize the kernel logger with an output sink.
///
/// A second call is ignored (the first sink wins).
pub fn init(sink: Sink) {
    SINK.call_once(|| sink);
}

/// Log a message with a specific level
pub fn log(level: Level, args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink(level, args);
    }
}

/// Log at TRACE level
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Trace, format_args!($($arg)*))
    };
}

/// Log at DEBUG level
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Debug, format_args!($($arg)*))
    };
}

/// Log at INFO level
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Info, format_args!($($arg)*))
    };
}

/// Log at WARN level
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Warn, format_args!($($arg)*))
    };
}

/// Log at ERROR level
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Error, format_args!($($arg)*))
    };
}
