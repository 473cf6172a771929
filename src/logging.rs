//! Leveled logging to stderr. Several dispatcher loops and the
//! webhook handler interleave in one process, so every line carries a
//! timestamp and its source location. The active level lives in a
//! process-global atomic, keeping disabled macro calls to one load.

use std::{
    fmt,
    io::{Write, stderr},
    sync::atomic::{AtomicU8, Ordering},
};

use chrono::{Local, SecondsFormat};

/// Declaration order is severity order; the comparisons the macros
/// rely on come from the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum LogLevel {
    /// Nothing at all; errors still reach the hosting service
    Quiet,
    /// The default: degraded operation (failed replies, publish
    /// retries, blocklist fetch failures)
    Warn,
    /// One line per state change: accepted jobs, dispatches,
    /// publications
    Info,
    /// Everything, for debugging this program
    Debug,
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// The single sink behind the macros. One locked write per line, so
/// lines from concurrent loops do not shear.
pub fn emit(level: &str, location: &str, args: fmt::Arguments<'_>) {
    let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut err = stderr().lock();
    _ = writeln!(err, "{timestamp} {level:5} {location} {args}");
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Warn) {
            $crate::logging::emit(
                "warn",
                concat!(file!(), ":", line!()),
                format_args!($($arg)*),
            );
        }
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Info) {
            $crate::logging::emit(
                "info",
                concat!(file!(), ":", line!()),
                format_args!($($arg)*),
            );
        }
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Debug) {
            $crate::logging::emit(
                "debug",
                concat!(file!(), ":", line!()),
                format_args!($($arg)*),
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn t_severity_order() {
        assert!(LogLevel::Quiet < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn t_enabled() {
        set_log_level(LogLevel::Info);
        assert!(enabled(LogLevel::Warn));
        assert!(enabled(LogLevel::Info));
        assert!(!enabled(LogLevel::Debug));
        set_log_level(LogLevel::Warn);
    }

    #[test]
    fn t_cli_names() {
        assert_eq!(
            LogLevel::from_str("debug", false).unwrap(),
            LogLevel::Debug
        );
        assert!(LogLevel::from_str("chatty", false).is_err());
    }
}
