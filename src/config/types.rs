use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Drop-oldest queue capacity between the socket and the forwarder
    pub queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10080,
            queue_capacity: 100_000,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl ListenerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub path: PathBuf,
    pub max_stream_length: u64,
    /// Number of appends between opportunistic trims
    pub trim_every: u64,
    pub groups: GroupsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/broker.duckdb"),
            max_stream_length: 1_000_000,
            trim_every: 1000,
            groups: GroupsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    #[serde(default = "default_raw_group")]
    pub raw: ConsumerGroupConfig,
    #[serde(default = "default_retry_group")]
    pub retry: ConsumerGroupConfig,
    #[serde(default = "default_failed_group")]
    pub failed: ConsumerGroupConfig,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            raw: default_raw_group(),
            retry: default_retry_group(),
            failed: default_failed_group(),
        }
    }
}

fn default_raw_group() -> ConsumerGroupConfig {
    ConsumerGroupConfig::named("raw-logs", 500, Duration::from_secs(1))
}

fn default_retry_group() -> ConsumerGroupConfig {
    ConsumerGroupConfig::named("retry-logs", 100, Duration::from_secs(2))
}

fn default_failed_group() -> ConsumerGroupConfig {
    ConsumerGroupConfig::named("failed-logs", 50, Duration::from_secs(5))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerGroupConfig {
    pub name: String,
    #[serde(default = "default_group_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_block_time", with = "humantime_serde")]
    pub block_time: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,
}

impl ConsumerGroupConfig {
    pub fn named(name: &str, batch_size: usize, block_time: Duration) -> Self {
        Self {
            name: name.to_string(),
            batch_size,
            block_time,
            max_retries: default_max_retries(),
            ack_timeout: default_ack_timeout(),
        }
    }
}

fn default_group_batch_size() -> usize {
    100
}

fn default_block_time() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retries() -> u32 {
    3
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Listener -> broker -> consumer groups -> storage
    Brokered,
    /// Listener -> flush engine -> storage, guarded by the circuit breaker
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: PipelineMode,
    pub max_batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub read_error_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_backoff_max: Duration,
    pub buffer: BufferConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    pub dead_letter_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Brokered,
            max_batch_size: 100,
            flush_interval: Duration::from_secs(10),
            read_error_delay: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(60),
            buffer: BufferConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check_interval: Duration::from_secs(30),
            dead_letter_dir: PathBuf::from("logs/dead-letter"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Hard cap; adds beyond it are refused
    pub max_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
            max_size: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub max_downtime: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(120),
            max_downtime: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub patterns: Vec<PatternConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub name: String,
    /// Text with `%{TOKEN:field}` placeholders
    pub pattern: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Records older than this are deleted; unset keeps everything
    #[serde(with = "humantime_serde")]
    pub retention: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub retention_check_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/loqi.duckdb"),
            retention: None,
            retention_check_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5000".to_string(),
        }
    }
}
