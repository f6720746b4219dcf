//! Pipeline configuration
//!
//! Nested configuration sections with platform defaults and
//! environment-based overrides under the `EVALD_` prefix.

use crate::error::{EvalError, EvalResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Platform-wide resource limits
    pub limits: PlatformLimits,
    /// Submission gateway configuration
    pub gateway: GatewayConfig,
    /// Sandbox pool configuration
    pub pool: PoolConfig,
    /// Dispatcher retry configuration
    pub retry: RetrySettings,
    /// Lifecycle monitor configuration
    pub monitor: MonitorConfig,
    /// Durable store writer configuration
    pub writer: WriterConfig,
}

impl PipelineConfig {
    /// Load defaults with environment overrides applied
    pub fn from_env() -> EvalResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("EVALD_MAX_SOURCE_BYTES") {
            config.limits.max_source_bytes = parse_var("EVALD_MAX_SOURCE_BYTES", &val)?;
        }
        if let Ok(val) = std::env::var("EVALD_MAX_TIMEOUT_SECS") {
            config.limits.max_timeout_secs = parse_var("EVALD_MAX_TIMEOUT_SECS", &val)?;
        }
        if let Ok(val) = std::env::var("EVALD_MAX_OUTPUT_BYTES") {
            config.limits.max_output_bytes = parse_var("EVALD_MAX_OUTPUT_BYTES", &val)?;
        }
        if let Ok(val) = std::env::var("EVALD_BUSY_TTL_SECS") {
            config.pool.busy_ttl_secs = parse_var("EVALD_BUSY_TTL_SECS", &val)?;
        }
        if let Ok(val) = std::env::var("EVALD_MAX_RETRIES") {
            config.retry.max_attempts = parse_var("EVALD_MAX_RETRIES", &val)?;
        }
        if let Ok(val) = std::env::var("EVALD_BATCH_CEILING") {
            config.gateway.batch_ceiling = parse_var("EVALD_BATCH_CEILING", &val)?;
        }
        if let Ok(val) = std::env::var("EVALD_RUNTIMES") {
            config.gateway.runtimes = val.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(val) = std::env::var("EVALD_GAP_WAIT_SECS") {
            config.monitor.gap_wait_secs = parse_var("EVALD_GAP_WAIT_SECS", &val)?;
        }
        if let Ok(val) = std::env::var("EVALD_ALLOW_SKIPPED_RUNNING") {
            config.writer.allow_skipped_running = parse_var("EVALD_ALLOW_SKIPPED_RUNNING", &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> EvalResult<()> {
        self.limits.validate()?;
        self.gateway.validate()?;
        self.pool.validate()?;
        self.retry.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, val: &str) -> EvalResult<T> {
    val.parse()
        .map_err(|_| EvalError::Validation(format!("Invalid value for {}: {}", name, val)))
}

/// Platform-wide limits applied to every evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformLimits {
    /// Maximum submitted source size in bytes
    pub max_source_bytes: usize,
    /// Maximum requested execution deadline in seconds
    pub max_timeout_secs: u64,
    /// Maximum captured bytes per output stream
    pub max_output_bytes: usize,
    /// Memory limit handed to the orchestrator, in MiB
    pub memory_limit_mb: u64,
    /// CPU limit handed to the orchestrator, in cores
    pub cpu_limit: f64,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self {
            max_source_bytes: 64 * 1024,
            max_timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
            memory_limit_mb: 512,
            cpu_limit: 0.5,
        }
    }
}

impl PlatformLimits {
    fn validate(&self) -> EvalResult<()> {
        if self.max_source_bytes == 0 {
            return Err(EvalError::Validation(
                "max_source_bytes must be positive".to_string(),
            ));
        }
        if self.max_timeout_secs == 0 {
            return Err(EvalError::Validation(
                "max_timeout_secs must be positive".to_string(),
            ));
        }
        if self.cpu_limit <= 0.0 {
            return Err(EvalError::Validation("cpu_limit must be positive".to_string()));
        }
        Ok(())
    }

    /// Bound captured output, appending a marker when truncated
    pub fn clamp_output(&self, output: &str) -> String {
        clamp_to(output, self.max_output_bytes)
    }
}

/// Truncate `s` to at most `max` bytes on a char boundary, with marker.
pub fn clamp_to(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &s[..end])
}

/// Submission gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Registered runtime tags accepted at submission
    pub runtimes: Vec<String>,
    /// Maximum items per batch submission
    pub batch_ceiling: usize,
    /// Batch fan-out rate, items per second
    pub batch_items_per_sec: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            runtimes: vec!["py".to_string(), "js".to_string()],
            batch_ceiling: 100,
            batch_items_per_sec: 10,
        }
    }
}

impl GatewayConfig {
    fn validate(&self) -> EvalResult<()> {
        if self.runtimes.is_empty() {
            return Err(EvalError::Validation(
                "at least one runtime tag must be registered".to_string(),
            ));
        }
        if self.batch_ceiling == 0 || self.batch_items_per_sec == 0 {
            return Err(EvalError::Validation(
                "batch limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Inter-item delay used when fanning out a batch
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(1000 / self.batch_items_per_sec as u64)
    }
}

/// Sandbox pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Busy-marker TTL in seconds; crash-recovery safety net
    pub busy_ttl_secs: u64,
    /// Base back-off while waiting for a free sandbox, milliseconds
    pub claim_backoff_ms: u64,
    /// Busy-marker reconciler interval in seconds
    pub reconcile_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            busy_ttl_secs: 600,
            claim_backoff_ms: 5000,
            reconcile_interval_secs: 300,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> EvalResult<()> {
        if self.busy_ttl_secs == 0 {
            return Err(EvalError::Validation("busy_ttl_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Busy-marker TTL as a duration
    pub fn busy_ttl(&self) -> Duration {
        Duration::from_secs(self.busy_ttl_secs)
    }
}

/// Dispatcher retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retry budget for retryable Phase-2 failures
    pub max_attempts: u32,
    /// Initial back-off delay in milliseconds
    pub initial_delay_ms: u64,
    /// Back-off ceiling in milliseconds
    pub max_delay_ms: u64,
    /// Dead-letter store capacity
    pub dlq_capacity: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 300_000,
            dlq_capacity: 10_000,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> EvalResult<()> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(EvalError::Validation(
                "max_delay_ms must be >= initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How long to hold an out-of-order event before releasing past a gap
    pub gap_wait_secs: u64,
    /// Watch connection renewal interval in seconds
    pub watch_reconnect_secs: u64,
    /// Orphan-job reconciler interval in seconds
    pub orphan_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            gap_wait_secs: 30,
            watch_reconnect_secs: 300,
            orphan_interval_secs: 300,
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> EvalResult<()> {
        if self.gap_wait_secs == 0 {
            return Err(EvalError::Validation("gap_wait_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Gap-wait timeout as a duration
    pub fn gap_wait(&self) -> Duration {
        Duration::from_secs(self.gap_wait_secs)
    }
}

/// Durable store writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Accept `queued -> completed` and `provisioning -> completed` for
    /// sub-100ms executions whose `running` event was lost in transit.
    pub allow_skipped_running: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            allow_skipped_running: true,
        }
    }
}
