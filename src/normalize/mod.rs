pub mod pattern;

use crate::config::types::NormalizerConfig;
use crate::record::{local_now, parse_correlation_id, LogLevel, LogRecord};
use pattern::{CompiledPattern, PatternError};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Source tag for records decoded from a JSON object payload.
pub const STRUCTURED_SOURCE: &str = "UDP:JSON";
/// Source tag for records taken from free text.
pub const FREE_TEXT_SOURCE: &str = "UDP:PlainText";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("payload is empty")]
    Empty,
}

/// The closed set of payload shapes the normalizer understands.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFormat<'a> {
    Structured(Map<String, Value>),
    FreeText(&'a str),
}

impl<'a> RawFormat<'a> {
    /// Classify a payload. Anything that is not a JSON object is free text.
    pub fn classify(payload: &'a str) -> Option<Self> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return None;
        }

        if trimmed.starts_with('{') {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
                return Some(RawFormat::Structured(map));
            }
        }

        Some(RawFormat::FreeText(trimmed))
    }
}

/// Turns raw payload text into canonical [`LogRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    patterns: Vec<CompiledPattern>,
}

impl Normalizer {
    pub fn new(patterns: Vec<CompiledPattern>) -> Self {
        Self { patterns }
    }

    pub fn from_config(config: &NormalizerConfig) -> Result<Self, PatternError> {
        let patterns = config
            .patterns
            .iter()
            .map(CompiledPattern::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns))
    }

    pub fn normalize(&self, payload: &str) -> Result<LogRecord, ParseFailure> {
        let fields = match RawFormat::classify(payload).ok_or(ParseFailure::Empty)? {
            RawFormat::Structured(map) => structured_fields(&map, payload.trim()),
            RawFormat::FreeText(text) => self.free_text_fields(text),
        };

        Ok(LogRecord {
            unique_id: Uuid::new_v4(),
            correlation_id: fields.correlation_id,
            message: fields.message,
            source: fields.source,
            level: fields.level,
            timestamp: local_now(),
        })
    }

    fn free_text_fields(&self, text: &str) -> Fields {
        for pattern in &self.patterns {
            let Some(captured) = pattern.captures(text) else {
                continue;
            };

            let message = captured
                .get("message")
                .filter(|m| !m.trim().is_empty())
                .map(|m| m.trim().to_string())
                .unwrap_or_else(|| text.to_string());
            let level = captured
                .get("level")
                .map(|l| LogLevel::from_name(l))
                .unwrap_or_else(|| LogLevel::infer(text));
            let source = captured
                .get("source")
                .filter(|s| !s.trim().is_empty())
                .cloned()
                .or_else(|| pattern.source.clone())
                .unwrap_or_else(|| FREE_TEXT_SOURCE.to_string());

            return Fields {
                message,
                level,
                source,
                correlation_id: parse_correlation_id(captured.get("correlation_id").map(String::as_str)),
            };
        }

        Fields {
            message: text.to_string(),
            level: LogLevel::infer(text),
            source: FREE_TEXT_SOURCE.to_string(),
            correlation_id: None,
        }
    }
}

struct Fields {
    message: String,
    level: LogLevel,
    source: String,
    correlation_id: Option<uuid::Uuid>,
}

fn structured_fields(map: &Map<String, Value>, payload: &str) -> Fields {
    let non_blank = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let level = match map.get("level") {
        Some(Value::String(name)) => LogLevel::from_name(name),
        Some(Value::Number(n)) => n.as_i64().and_then(LogLevel::from_id).unwrap_or_default(),
        _ => LogLevel::default(),
    };

    Fields {
        message: non_blank("message").unwrap_or(payload).to_string(),
        level,
        source: non_blank("source").unwrap_or(STRUCTURED_SOURCE).to_string(),
        correlation_id: parse_correlation_id(non_blank("correlationId").or_else(|| non_blank("correlation_id"))),
    }
}
