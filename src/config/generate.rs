pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOQI CONFIGURATION
# =============================================================================
# Every section is optional; omitted keys take the defaults shown here.
# Durations accept humantime syntax: 500ms, 10s, 2m, 1h, 7days.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/loqi/config.yml
#   3. /etc/loqi/config.yml
#
# Paths may use ~ and $env{...} expansion.

# =============================================================================
# LISTENER
# =============================================================================
# UDP datagrams are decoded as UTF-8 text and pushed into a bounded queue.
# When the queue is full the oldest entry is dropped to admit the newest.

listener:
  host: 0.0.0.0
  port: 10080
  queue_capacity: 100000
  # Delay before retrying a failed receive or broker append
  retry_delay: 1s

# =============================================================================
# BROKER
# =============================================================================
# Durable append log between the listener and the consumers. Each group keeps
# its own cursor and pending-acknowledgment set.

broker:
  path: data/broker.duckdb
  max_stream_length: 1000000
  # Trim the stream after this many appends
  trim_every: 1000
  groups:
    raw:
      name: raw-logs
      batch_size: 500
      block_time: 1s
      max_retries: 3
      ack_timeout: 30s
    retry:
      name: retry-logs
      batch_size: 100
      block_time: 2s
      max_retries: 3
      ack_timeout: 30s
    failed:
      name: failed-logs
      batch_size: 50
      block_time: 5s
      max_retries: 3
      ack_timeout: 30s

# =============================================================================
# PIPELINE
# =============================================================================
# mode: brokered  listener -> broker -> consumer groups -> storage
# mode: direct    listener -> in-memory buffer -> storage (circuit breaker)

pipeline:
  mode: brokered
  max_batch_size: 100
  flush_interval: 10s
  read_error_delay: 5s
  shutdown_grace: 5s
  # Backoff before reprocessing a retry entry: retry_backoff * 2^(attempts-1)
  retry_backoff: 1s
  retry_backoff_max: 60s
  buffer:
    batch_size: 500
    flush_interval: 1s
    max_size: 50000
  circuit_breaker:
    failure_threshold: 5
    open_duration: 2m
    max_downtime: 5m
  health_check_interval: 30s
  dead_letter_dir: logs/dead-letter

# =============================================================================
# NORMALIZER
# =============================================================================
# Named-capture patterns applied to free-text payloads. Tokens: IP, WORD, INT,
# NUMBER, UUID, TIMESTAMP, PATH, LOGLEVEL, GREEDYDATA, DATA, NOTSPACE.
# Captured fields named message, level, source and correlation_id populate
# the record.

normalizer:
  patterns: []
  # patterns:
  #   - name: nginx_error
  #     pattern: '%{TIMESTAMP:ts} \[%{LOGLEVEL:level}\] %{GREEDYDATA:message}'
  #     source: nginx

# =============================================================================
# STORAGE
# =============================================================================

storage:
  path: data/loqi.duckdb
  # Uncomment to delete records older than the horizon
  # retention: 30days
  retention_check_interval: 1h

# =============================================================================
# WEB
# =============================================================================

web:
  listen: 127.0.0.1:5000
"#
    .to_string()
}
