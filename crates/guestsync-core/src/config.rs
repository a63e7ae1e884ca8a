//! Runtime configuration.
//!
//! Settings come from the environment, are resolved on first use and cached
//! in atomics so hot paths never touch `std::env`:
//! - `GUESTSYNC_LOG`: `off`, `error`, `warn` (default), `info`, `debug`, `trace`.
//! - `GUESTSYNC_LOG_FILE`: path of the JSONL log sink. Unset means stderr.
//! - `GUESTSYNC_PULSE_US`: window between set and reset in `Event::pulse`,
//!   in microseconds (default 10).
//!
//! Unknown values fall back to the default. Tests and embedders can pin a
//! value with the `set_*` functions, which win over the environment.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use crate::log::LogLevel;

pub const LOG_ENV: &str = "GUESTSYNC_LOG";
pub const LOG_FILE_ENV: &str = "GUESTSYNC_LOG_FILE";
pub const PULSE_ENV: &str = "GUESTSYNC_PULSE_US";

/// Default pulse window, matching a short host yield.
pub const DEFAULT_PULSE_WINDOW: Duration = Duration::from_micros(10);

// Atomic cache: 0=unresolved, 1..=6 = LogLevel, 255=resolving.
static CACHED_LOG_LEVEL: AtomicU8 = AtomicU8::new(0);

const LEVEL_UNRESOLVED: u8 = 0;
const LEVEL_RESOLVING: u8 = 255;

const PULSE_UNRESOLVED: u64 = u64::MAX;
static CACHED_PULSE_US: AtomicU64 = AtomicU64::new(PULSE_UNRESOLVED);

impl LogLevel {
    /// Parse from string (case-insensitive). Unknown input maps to `Warn`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Self::Off,
            "error" => Self::Error,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" | "all" => Self::Trace,
            _ => Self::Warn,
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Off => 1,
            Self::Error => 2,
            Self::Warn => 3,
            Self::Info => 4,
            Self::Debug => 5,
            Self::Trace => 6,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Off,
            2 => Self::Error,
            4 => Self::Info,
            5 => Self::Debug,
            6 => Self::Trace,
            _ => Self::Warn,
        }
    }
}

/// Configured log level (reads `GUESTSYNC_LOG` on first call, caches thereafter).
///
/// A caller racing the first resolution sees `Warn` until the cache is filled.
#[must_use]
pub fn log_level() -> LogLevel {
    let cached = CACHED_LOG_LEVEL.load(Ordering::Relaxed);
    if cached != LEVEL_UNRESOLVED && cached != LEVEL_RESOLVING {
        return LogLevel::from_u8(cached);
    }
    if cached == LEVEL_RESOLVING {
        return LogLevel::Warn;
    }

    if CACHED_LOG_LEVEL
        .compare_exchange(
            LEVEL_UNRESOLVED,
            LEVEL_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_LOG_LEVEL.load(Ordering::Relaxed);
        return if v != LEVEL_UNRESOLVED && v != LEVEL_RESOLVING {
            LogLevel::from_u8(v)
        } else {
            LogLevel::Warn
        };
    }

    let level = std::env::var(LOG_ENV)
        .map(|v| LogLevel::from_str_loose(&v))
        .unwrap_or(LogLevel::Warn);
    CACHED_LOG_LEVEL.store(level.to_u8(), Ordering::Release);
    level
}

/// Pin the log level, overriding the environment.
pub fn set_log_level(level: LogLevel) {
    CACHED_LOG_LEVEL.store(level.to_u8(), Ordering::Release);
}

/// Path of the JSONL log sink, if one is configured.
#[must_use]
pub fn log_file_path() -> Option<PathBuf> {
    std::env::var_os(LOG_FILE_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_pulse_env(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|us| *us <= 1_000_000)
}

/// Window between set and reset used by `Event::pulse`.
#[must_use]
pub fn pulse_window() -> Duration {
    let cached = CACHED_PULSE_US.load(Ordering::Relaxed);
    if cached != PULSE_UNRESOLVED {
        return Duration::from_micros(cached);
    }
    let micros = std::env::var(PULSE_ENV)
        .ok()
        .and_then(|v| parse_pulse_env(&v))
        .unwrap_or(DEFAULT_PULSE_WINDOW.as_micros() as u64);
    // Losing this race is harmless: both writers computed from the same env.
    let _ = CACHED_PULSE_US.compare_exchange(
        PULSE_UNRESOLVED,
        micros,
        Ordering::AcqRel,
        Ordering::Relaxed,
    );
    Duration::from_micros(CACHED_PULSE_US.load(Ordering::Acquire))
}

/// Pin the pulse window, overriding the environment. Clamped to one second.
pub fn set_pulse_window(window: Duration) {
    let micros = window.as_micros().min(1_000_000) as u64;
    CACHED_PULSE_US.store(micros, Ordering::Release);
}
