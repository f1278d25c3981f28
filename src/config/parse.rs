use super::types::*;
use crate::config::{expand_env_vars, expand_tilde};
use crate::normalize::pattern::CompiledPattern;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config_str(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(inner) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), inner),
        )),
        other => other,
    })
}

/// Load the config at `path`, or fall back to built-in defaults when there is none.
pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            let mut config = Config::default();
            expand_paths(&mut config);
            validate_config(&config)?;
            Ok(config)
        }
    }
}

pub fn parse_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = if yaml_string.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&yaml_string)?
    };

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let Ok(re) = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return Ok(());
    };

    let mut unexpanded_vars: Vec<String> = re
        .captures_iter(yaml_string)
        .map(|cap| cap[1].to_string())
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}\n\
         \n\
         Set them (e.g. export LOQI_DATA=/var/lib/loqi) or replace the\n\
         $env{{...}} references in the config file with literal values",
        unexpanded_vars.join(", ")
    )))
}

/// Expands tilde (~) in all PathBuf fields in the config.
fn expand_paths(config: &mut Config) {
    config.broker.path = expand_tilde(&config.broker.path);
    config.storage.path = expand_tilde(&config.storage.path);
    config.pipeline.dead_letter_dir = expand_tilde(&config.pipeline.dead_letter_dir);
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_listener(&config.listener, &mut errors);
    validate_broker(&config.broker, &mut errors);
    validate_pipeline(&config.pipeline, &mut errors);
    validate_patterns(&config.normalizer, &mut errors);

    if config.web.listen.trim().is_empty() {
        errors.push("web.listen cannot be empty".to_string());
    }

    if let Some(retention) = config.storage.retention {
        if retention.is_zero() {
            errors.push("storage.retention must be greater than zero when set".to_string());
        }
        if config.storage.retention_check_interval.is_zero() {
            errors.push("storage.retention_check_interval must be greater than zero".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_listener(listener: &ListenerConfig, errors: &mut Vec<String>) {
    if listener.queue_capacity == 0 {
        errors.push("listener.queue_capacity must be at least 1".to_string());
    }
    if listener.host.trim().is_empty() {
        errors.push("listener.host cannot be empty".to_string());
    }
}

fn validate_broker(broker: &BrokerConfig, errors: &mut Vec<String>) {
    if broker.max_stream_length == 0 {
        errors.push("broker.max_stream_length must be at least 1".to_string());
    }
    if broker.trim_every == 0 {
        errors.push("broker.trim_every must be at least 1".to_string());
    }

    let groups = [
        ("raw", &broker.groups.raw),
        ("retry", &broker.groups.retry),
        ("failed", &broker.groups.failed),
    ];

    let mut names = HashSet::new();
    for (key, group) in groups {
        let prefix = format!("broker.groups.{}", key);
        if group.name.trim().is_empty() {
            errors.push(format!("{}: name cannot be empty", prefix));
        } else if !names.insert(group.name.as_str()) {
            errors.push(format!("{}: duplicate group name '{}'", prefix, group.name));
        }
        if group.batch_size == 0 {
            errors.push(format!("{}: batch_size must be at least 1", prefix));
        }
        if group.ack_timeout.is_zero() {
            errors.push(format!("{}: ack_timeout must be greater than zero", prefix));
        }
    }
}

fn validate_pipeline(pipeline: &PipelineConfig, errors: &mut Vec<String>) {
    if pipeline.max_batch_size == 0 {
        errors.push("pipeline.max_batch_size must be at least 1".to_string());
    }
    if pipeline.flush_interval.is_zero() {
        errors.push("pipeline.flush_interval must be greater than zero".to_string());
    }
    if pipeline.retry_backoff > pipeline.retry_backoff_max {
        errors.push("pipeline.retry_backoff cannot exceed pipeline.retry_backoff_max".to_string());
    }
    if pipeline.health_check_interval.is_zero() {
        errors.push("pipeline.health_check_interval must be greater than zero".to_string());
    }

    let buffer = &pipeline.buffer;
    if buffer.max_size == 0 {
        errors.push("pipeline.buffer.max_size must be at least 1".to_string());
    }
    if buffer.batch_size == 0 {
        errors.push("pipeline.buffer.batch_size must be at least 1".to_string());
    } else if buffer.batch_size > buffer.max_size {
        errors.push("pipeline.buffer.batch_size cannot exceed pipeline.buffer.max_size".to_string());
    }
    if buffer.flush_interval.is_zero() {
        errors.push("pipeline.buffer.flush_interval must be greater than zero".to_string());
    }

    if pipeline.circuit_breaker.failure_threshold == 0 {
        errors.push("pipeline.circuit_breaker.failure_threshold must be at least 1".to_string());
    }
}

fn validate_patterns(normalizer: &NormalizerConfig, errors: &mut Vec<String>) {
    let mut names = HashSet::new();
    for (i, pattern) in normalizer.patterns.iter().enumerate() {
        let prefix = format!("normalizer.patterns[{}]", i);
        if pattern.name.trim().is_empty() {
            errors.push(format!("{}: name cannot be empty", prefix));
        } else if !names.insert(pattern.name.as_str()) {
            errors.push(format!("{}: duplicate pattern name '{}'", prefix, pattern.name));
        }
        if let Err(e) = CompiledPattern::compile(pattern) {
            errors.push(format!("{} '{}': {}", prefix, pattern.name, e));
        }
    }
}
