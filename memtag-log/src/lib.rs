//! Logging for memtag.
//!
//! Every failure the cache intercepts at its operation boundary ends up here,
//! so this crate is the side channel that carries per-failure detail while
//! callers only see booleans, counts and optional values.
//!
//! # Usage
//!
//! ```rust
//! use memtag_log::{debug, error, info};
//!
//! info!("connected to {} servers", 2);
//! debug!(target: "memtag::tags", "tag record '{}' is dirty", "users");
//! error!("set failed: {}", "timeout");
//! ```
//!
//! # Environment Variables
//!
//! - `MEMTAG_DEBUG=1` - Enable debug logging
//! - `MEMTAG_LOG_LEVEL=trace|debug|info|warn|error|off` - Minimum level
//! - `MEMTAG_LOG_FORMAT=json|pretty|compact` - Output format (`json` by default)
//! - `MEMTAG_LOG_TIMESTAMPS=0|1` - Include timestamps
//! - `MEMTAG_LOG_COLOR=0|1` - Colored level names in `pretty` output

use once_cell::sync::Lazy;
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Per-record tag index detail
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level
    Error = 4,
    /// Nothing is written
    Off = 5,
}

impl Level {
    /// Upper-case level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            4 => Level::Error,
            _ => Level::Off,
        }
    }

    #[cfg(feature = "color")]
    fn colored(&self) -> colored::ColoredString {
        use colored::Colorize;
        match self {
            Level::Trace => "TRACE".magenta(),
            Level::Debug => "DEBUG".blue(),
            Level::Info => "INFO".green(),
            Level::Warn => "WARN".yellow(),
            Level::Error => "ERROR".red().bold(),
            Level::Off => "OFF".white(),
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// One JSON object per line
    Json,
    /// Human readable, with full timestamp and target
    Pretty,
    /// Short single-line format
    Compact,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static SETTINGS: Lazy<LogSettings> = Lazy::new(LogSettings::from_env);

// Read once; level and debug live in the atomics so they can change later.
struct LogSettings {
    format: Format,
    #[cfg_attr(not(feature = "color"), allow(dead_code))]
    color: bool,
    timestamps: bool,
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl LogSettings {
    fn from_env() -> Self {
        let debug = env_flag("MEMTAG_DEBUG").unwrap_or(false);
        let level = env::var("MEMTAG_LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(if debug { Level::Debug } else { Level::Info });
        DEBUG_ENABLED.store(debug, Ordering::SeqCst);
        LOG_LEVEL.store(level as u8, Ordering::SeqCst);

        Self {
            format: env::var("MEMTAG_LOG_FORMAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Format::Json),
            color: env_flag("MEMTAG_LOG_COLOR").unwrap_or_else(|| env::var("NO_COLOR").is_err()),
            timestamps: env_flag("MEMTAG_LOG_TIMESTAMPS").unwrap_or(true),
        }
    }
}

/// Whether a line at `level` would be written. `MEMTAG_DEBUG` (or
/// [`set_debug`]) lets debug lines through whatever the level.
#[inline]
pub fn is_level_enabled(level: Level) -> bool {
    Lazy::force(&SETTINGS);
    match level {
        Level::Off => false,
        Level::Debug if DEBUG_ENABLED.load(Ordering::Relaxed) => true,
        _ => level as u8 >= LOG_LEVEL.load(Ordering::Relaxed),
    }
}

/// Current minimum level.
pub fn current_level() -> Level {
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Change the minimum level at runtime.
pub fn set_level(level: Level) {
    Lazy::force(&SETTINGS);
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Toggle debug output at runtime without touching the level.
pub fn set_debug(enabled: bool) {
    Lazy::force(&SETTINGS);
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
}

/// Write one log line. Used by the macros.
#[doc(hidden)]
pub fn log(level: Level, target: &str, message: &str) {
    if !is_level_enabled(level) {
        return;
    }
    let settings: &LogSettings = &SETTINGS;

    let mut stderr = std::io::stderr().lock();
    let _ = match settings.format {
        Format::Json => writeln!(stderr, "{}", json_line(level, target, message)),
        Format::Pretty => write_pretty(&mut stderr, level, target, message, settings),
        Format::Compact => write_compact(&mut stderr, level, target, message, settings),
    };
}

fn write_pretty(
    out: &mut impl Write,
    level: Level,
    target: &str,
    message: &str,
    settings: &LogSettings,
) -> std::io::Result<()> {
    if settings.timestamps {
        write!(out, "{} ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))?;
    }

    #[cfg(feature = "color")]
    if settings.color {
        write!(out, "{:5} ", level.colored())?;
    } else {
        write!(out, "{:5} ", level.as_str())?;
    }
    #[cfg(not(feature = "color"))]
    write!(out, "{:5} ", level.as_str())?;

    if !target.is_empty() {
        write!(out, "[{}] ", target)?;
    }
    writeln!(out, "{}", message)
}

fn write_compact(
    out: &mut impl Write,
    level: Level,
    target: &str,
    message: &str,
    settings: &LogSettings,
) -> std::io::Result<()> {
    if settings.timestamps {
        write!(out, "{} ", chrono::Local::now().format("%H:%M:%S"))?;
    }
    let initial = level.as_str().chars().next().unwrap_or('?');
    if target.is_empty() {
        writeln!(out, "{} {}", initial, message)
    } else {
        writeln!(out, "{} {}: {}", initial, target, message)
    }
}

fn json_line(level: Level, target: &str, message: &str) -> String {
    #[derive(serde::Serialize)]
    struct Line<'a> {
        timestamp: String,
        level: &'a str,
        target: &'a str,
        message: &'a str,
    }

    let line = Line {
        timestamp: chrono::Utc::now().to_rfc3339(),
        level: level.as_str(),
        target,
        message,
    };
    serde_json::to_string(&line).unwrap_or_else(|_| message.to_string())
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log {
    ($level:expr, target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($level) {
            $crate::log($level, $target, &format!($($arg)+));
        }
    };
    ($level:expr, $($arg:tt)+) => {
        $crate::__log!($level, target: module_path!(), $($arg)+)
    };
}

/// Log a trace message.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Trace, $($arg)+) };
}

/// Log a debug message.
///
/// Written when `MEMTAG_DEBUG=1` or `MEMTAG_LOG_LEVEL` is `debug` or lower.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Debug, $($arg)+) };
}

/// Log an info message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Info, $($arg)+) };
}

/// Log a warning message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Warn, $($arg)+) };
}

/// Log an error message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Error, $($arg)+) };
}
