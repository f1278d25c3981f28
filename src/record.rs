use chrono::{DateTime, FixedOffset, Local, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Severity of a log record, stored as its integer id (0..=5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LogLevel {
    Verbose = 0,
    Debug = 1,
    #[default]
    Information = 2,
    Warning = 3,
    Error = 4,
    Fatal = 5,
}

#[derive(Debug, Error)]
#[error("level id {0} is outside 0..=5")]
pub struct InvalidLevel(pub i64);

impl LogLevel {
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Verbose,
        LogLevel::Debug,
        LogLevel::Information,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Fatal,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(LogLevel::Verbose),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Information),
            3 => Some(LogLevel::Warning),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    /// Map a level name to a level, case-insensitively.
    /// Unknown or empty names map to `Information`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "verbose" => LogLevel::Verbose,
            "debug" | "trace" => LogLevel::Debug,
            "info" | "information" => LogLevel::Information,
            "warn" | "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "fatal" | "critical" => LogLevel::Fatal,
            _ => LogLevel::Information,
        }
    }

    /// Infer a level from free text by substring match, most severe first.
    pub fn infer(message: &str) -> Self {
        let lower = message.to_lowercase();
        let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if contains_any(&["fatal", "critical"]) {
            LogLevel::Fatal
        } else if contains_any(&["error", "exception"]) {
            LogLevel::Error
        } else if contains_any(&["warn"]) {
            LogLevel::Warning
        } else if contains_any(&["info"]) {
            LogLevel::Information
        } else if contains_any(&["debug", "trace"]) {
            LogLevel::Debug
        } else if contains_any(&["verbose"]) {
            LogLevel::Verbose
        } else {
            LogLevel::Information
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Verbose => "Verbose",
            LogLevel::Debug => "Debug",
            LogLevel::Information => "Information",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> Self {
        level.id()
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = InvalidLevel;

    fn try_from(id: u8) -> Result<Self, InvalidLevel> {
        LogLevel::from_id(id as i64).ok_or(InvalidLevel(id as i64))
    }
}

/// The canonical, queryable log entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub unique_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub message: String,
    pub source: String,
    pub level: LogLevel,
    /// Wall-clock time with the UTC offset it was recorded under
    pub timestamp: DateTime<FixedOffset>,
}

impl LogRecord {
    pub fn new(message: impl Into<String>, source: impl Into<String>, level: LogLevel) -> Self {
        Self {
            unique_id: Uuid::new_v4(),
            correlation_id: None,
            message: message.into(),
            source: source.into(),
            level,
            timestamp: local_now(),
        }
    }

    pub fn epoch_seconds(&self) -> i64 {
        self.timestamp.timestamp()
    }

    pub fn offset_minutes(&self) -> i32 {
        self.timestamp.offset().local_minus_utc() / 60
    }
}

/// Current local time at whole-second precision, matching what storage keeps.
pub fn local_now() -> DateTime<FixedOffset> {
    let now = Local::now().fixed_offset();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Rebuild a timestamp from its stored (epoch seconds, offset minutes) pair.
pub fn reconstruct_timestamp(epoch_seconds: i64, offset_minutes: i32) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(offset_minutes.checked_mul(60)?)?;
    let utc = DateTime::from_timestamp(epoch_seconds, 0)?;
    Some(utc.with_timezone(&offset))
}

/// Parse an optional correlation id, keeping it only if it is a well-formed UUID.
pub fn parse_correlation_id(raw: Option<&str>) -> Option<Uuid> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| Uuid::parse_str(s).ok())
}
