//! Named-capture patterns: `%{TOKEN:field}` placeholders expanded into regex groups.

use crate::config::types::PatternConfig;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("unknown pattern token '{token}'")]
    UnknownToken { token: String },

    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),
}

/// Built-in token library.
fn token_regex(token: &str) -> Option<&'static str> {
    let re = match token {
        "IP" => r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}",
        "WORD" => r"\w+",
        "INT" => r"[+-]?\d+",
        "NUMBER" => r"[+-]?\d+(?:\.\d+)?",
        "UUID" => r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        "TIMESTAMP" => {
            r"\d{2}/\w{3}/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4}|\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?"
        }
        "PATH" => r"/[^\s]*",
        "LOGLEVEL" => r"(?i:verbose|trace|debug|info(?:rmation)?|warn(?:ing)?|error|fatal|critical)",
        "GREEDYDATA" => r".*",
        "DATA" => r".*?",
        "NOTSPACE" => r"\S+",
        _ => return None,
    };
    Some(re)
}

/// Expand placeholders into a regex source string. Text between placeholders is
/// passed through as regex.
pub fn expand(pattern: &str) -> Result<String, PatternError> {
    let placeholder = Regex::new(r"%\{(\w+)(?::(\w+))?\}")?;

    let mut out = String::with_capacity(pattern.len() * 2);
    let mut last = 0;
    for caps in placeholder.captures_iter(pattern) {
        let (Some(whole), Some(token)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let body = token_regex(token.as_str()).ok_or_else(|| PatternError::UnknownToken {
            token: token.as_str().to_string(),
        })?;

        out.push_str(&pattern[last..whole.start()]);
        match caps.get(2) {
            Some(field) => out.push_str(&format!("(?P<{}>{})", field.as_str(), body)),
            None => out.push_str(&format!("(?:{})", body)),
        }
        last = whole.end();
    }
    out.push_str(&pattern[last..]);

    Ok(out)
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub name: String,
    pub source: Option<String>,
    regex: Regex,
}

impl CompiledPattern {
    pub fn compile(config: &PatternConfig) -> Result<Self, PatternError> {
        let regex = Regex::new(&expand(&config.pattern)?)?;
        Ok(Self {
            name: config.name.clone(),
            source: config.source.clone(),
            regex,
        })
    }

    /// Named captures of the first match, or `None` when the line doesn't match.
    pub fn captures(&self, line: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(line)?;
        let fields = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();
        Some(fields)
    }
}
