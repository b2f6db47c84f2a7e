//! Env-gated diagnostics for the scheduler and kernels.
//!
//! `PARTIALRUN_TRACE=1` enables trace and error lines, `PARTIALRUN_TRACE=full`
//! adds warnings. Critical lines are always written. Each line carries the
//! wall-clock time and the thread it came from, `stream-N` for stream workers
//! and `host` otherwise.
use std::env;
use std::fmt::Arguments;
use std::io::{self, IsTerminal, Write};
use std::sync::OnceLock;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

const TRACE_ENV: &str = "PARTIALRUN_TRACE";
const STREAM_THREAD_PREFIX: &str = "partialrun-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TraceLevel {
    Off,
    Basic,
    Full,
}

/// Kind of a log line; decides its tag, colour and the level that enables it.
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Trace,
    Warning,
    Error,
    Critical,
}

impl Severity {
    fn tag(self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Severity::Trace => "34",
            Severity::Warning => "33",
            Severity::Error => "91",
            Severity::Critical => "31",
        }
    }

    fn required(self) -> TraceLevel {
        match self {
            Severity::Trace | Severity::Error => TraceLevel::Basic,
            Severity::Warning => TraceLevel::Full,
            Severity::Critical => TraceLevel::Off,
        }
    }
}

static TRACE_LEVEL: OnceLock<TraceLevel> = OnceLock::new();

fn parse_trace_level(value: &str) -> TraceLevel {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "basic" => TraceLevel::Basic,
        "full" => TraceLevel::Full,
        _ => TraceLevel::Off,
    }
}

fn trace_level() -> TraceLevel {
    *TRACE_LEVEL.get_or_init(|| {
        env::var(TRACE_ENV)
            .map(|value| parse_trace_level(&value))
            .unwrap_or(TraceLevel::Off)
    })
}

fn enabled_at(level: TraceLevel, severity: Severity) -> bool {
    level >= severity.required()
}

fn timestamp_hms() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        % 86_400;
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3_600,
        (secs % 3_600) / 60,
        secs % 60
    )
}

fn origin_of(thread_name: Option<&str>) -> &str {
    thread_name
        .and_then(|name| name.strip_prefix(STREAM_THREAD_PREFIX))
        .filter(|name| name.starts_with("stream-"))
        .unwrap_or("host")
}

fn format_line(severity: Severity, origin: &str, colored: bool, args: Arguments) -> String {
    let ts = timestamp_hms();
    let tag = severity.tag();
    if colored {
        let color = severity.color();
        format!("{ts} [\u{001b}[{color}m{tag}\u{001b}[0m] ({origin}) -- {args}")
    } else {
        format!("{ts} [{tag}] ({origin}) -- {args}")
    }
}

/// Write one line to stderr when the configured level allows `severity`.
#[doc(hidden)]
pub fn emit(severity: Severity, args: Arguments) {
    if !enabled_at(trace_level(), severity) {
        return;
    }
    let current = thread::current();
    let origin = origin_of(current.name());
    let stderr = io::stderr();
    let line = format_line(severity, origin, stderr.is_terminal(), args);
    let _ = writeln!(stderr.lock(), "{line}");
}

/// Emit a warning message via the logging subsystem.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        $crate::logging::emit($crate::logging::Severity::Warning, format_args!($($arg)*))
    };
}

/// Emit an error message via the logging subsystem.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logging::emit($crate::logging::Severity::Error, format_args!($($arg)*))
    };
}

/// Emit a critical message via the logging subsystem.
#[macro_export]
macro_rules! critical {
    ($($arg:tt)*) => {
        $crate::logging::emit($crate::logging::Severity::Critical, format_args!($($arg)*))
    };
}

/// Emit a trace message via the logging subsystem.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::logging::emit($crate::logging::Severity::Trace, format_args!($($arg)*))
    };
}
