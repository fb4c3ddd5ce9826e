// Executor defaults, environment/YAML overrides and validation.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::ConfigError;
use crate::selector::SelectorPolicy;

pub(crate) const DEFAULT_MAX_CHANNELS: usize = 4;
pub(crate) const DEFAULT_STREAMS_PER_CHANNEL: usize = 8;
pub(crate) const DEFAULT_REQUESTS_PER_STREAM: usize = 64;
pub(crate) const DEFAULT_TOTAL_REQUESTS_PER_STREAM: usize = 1024;
pub(crate) const DEFAULT_MAX_BATCH_BYTES: usize = 256 * 1024;
pub(crate) const DEFAULT_MAX_BYTES_PER_STREAM: usize = 64 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_STREAM_AGE: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MAX_QUEUE_SIZE: usize = 64 * 1024;
pub(crate) const DEFAULT_POKE_INTERVAL: Duration = Duration::from_millis(1);
pub(crate) const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_TERMINATION_WAIT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_LOW_WATERMARK: usize = 32;
pub(crate) const DEFAULT_HIGH_WATERMARK: usize = 128;

/// Hard safety cap for any single frame read from the gateway.
///
/// The reader allocates a buffer sized by the advertised frame length, so an
/// uncapped peer could force arbitrarily large allocations.
/// Override with `KVPROXY_MAX_FRAME_BYTES`.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Scheduling policy for one `CallExecutor`.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of pooled channels (connections).
    pub max_channels: usize,
    /// Workers per channel; each worker owns at most one stream.
    pub max_concurrent_streams_per_channel: usize,
    /// Upper bound on calls in one batch.
    pub max_concurrent_requests_per_stream: usize,
    /// Calls a stream may carry over its lifetime before it is rotated.
    pub total_requests_per_stream: usize,
    pub max_batch_bytes: usize,
    pub max_bytes_per_stream: usize,
    pub max_stream_age: Duration,
    pub max_queue_size: usize,
    /// Sub-queues per method.
    pub queue_shards: usize,
    pub poke_interval: Duration,
    /// Deadline applied to calls submitted without one.
    pub default_call_timeout: Duration,
    pub connect_timeout: Duration,
    pub termination_wait_timeout: Duration,
    pub max_frame_bytes: usize,
    /// Channel selection for enqueue-time wake-ups. `None` wakes every channel.
    pub selector: Option<SelectorPolicy>,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ExecutorConfigOverride {
    max_channels: Option<usize>,
    max_concurrent_streams_per_channel: Option<usize>,
    max_concurrent_requests_per_stream: Option<usize>,
    total_requests_per_stream: Option<usize>,
    max_batch_bytes: Option<usize>,
    max_bytes_per_stream: Option<usize>,
    max_stream_age_ms: Option<u64>,
    max_queue_size: Option<usize>,
    queue_shards: Option<usize>,
    poke_interval_ms: Option<u64>,
    default_call_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    termination_wait_timeout_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    selector: Option<String>,
    low_watermark: Option<usize>,
    high_watermark: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::optimized_defaults()
    }
}

impl ExecutorConfig {
    pub fn optimized_defaults() -> Self {
        Self {
            max_channels: DEFAULT_MAX_CHANNELS,
            max_concurrent_streams_per_channel: DEFAULT_STREAMS_PER_CHANNEL,
            max_concurrent_requests_per_stream: DEFAULT_REQUESTS_PER_STREAM,
            total_requests_per_stream: DEFAULT_TOTAL_REQUESTS_PER_STREAM,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_bytes_per_stream: DEFAULT_MAX_BYTES_PER_STREAM,
            max_stream_age: DEFAULT_MAX_STREAM_AGE,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            queue_shards: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            poke_interval: DEFAULT_POKE_INTERVAL,
            default_call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            termination_wait_timeout: DEFAULT_TERMINATION_WAIT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            selector: None,
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
        }
    }

    /// Defaults, then `KVPROXY_*` environment variables, then the YAML file at
    /// `config_path` (or `KVPROXY_CLIENT_CONFIG`). Zero values are ignored.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("KVPROXY_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ExecutorConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }

    fn from_env() -> Result<Self> {
        let mut config = Self::optimized_defaults();
        if let Some(value) = read_usize_env("KVPROXY_MAX_CHANNELS") {
            config.max_channels = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_STREAMS_PER_CHANNEL") {
            config.max_concurrent_streams_per_channel = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_REQUESTS_PER_STREAM") {
            config.max_concurrent_requests_per_stream = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_TOTAL_REQUESTS_PER_STREAM") {
            config.total_requests_per_stream = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_MAX_BATCH_BYTES") {
            config.max_batch_bytes = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_MAX_BYTES_PER_STREAM") {
            config.max_bytes_per_stream = value;
        }
        if let Some(value) = read_millis_env("KVPROXY_MAX_STREAM_AGE_MS") {
            config.max_stream_age = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_MAX_QUEUE_SIZE") {
            config.max_queue_size = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_QUEUE_SHARDS") {
            config.queue_shards = value;
        }
        if let Some(value) = read_millis_env("KVPROXY_POKE_INTERVAL_MS") {
            config.poke_interval = value;
        }
        if let Some(value) = read_millis_env("KVPROXY_CALL_TIMEOUT_MS") {
            config.default_call_timeout = value;
        }
        if let Some(value) = read_millis_env("KVPROXY_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = value;
        }
        if let Some(value) = read_millis_env("KVPROXY_TERMINATION_WAIT_MS") {
            config.termination_wait_timeout = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_MAX_FRAME_BYTES") {
            config.max_frame_bytes = value;
        }
        if let Ok(value) = std::env::var("KVPROXY_SELECTOR") {
            config.selector = Some(SelectorPolicy::parse(&value)?);
        }
        if let Some(value) = read_usize_env("KVPROXY_LOW_WATERMARK") {
            config.low_watermark = value;
        }
        if let Some(value) = read_usize_env("KVPROXY_HIGH_WATERMARK") {
            config.high_watermark = value;
        }
        Ok(config)
    }

    /// Reject policies the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_channels", self.max_channels),
            (
                "max_concurrent_streams_per_channel",
                self.max_concurrent_streams_per_channel,
            ),
            (
                "max_concurrent_requests_per_stream",
                self.max_concurrent_requests_per_stream,
            ),
            ("total_requests_per_stream", self.total_requests_per_stream),
            ("max_batch_bytes", self.max_batch_bytes),
            ("max_bytes_per_stream", self.max_bytes_per_stream),
            ("max_queue_size", self.max_queue_size),
            ("queue_shards", self.queue_shards),
            ("max_frame_bytes", self.max_frame_bytes),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        let durations = [
            ("max_stream_age", self.max_stream_age),
            ("poke_interval", self.poke_interval),
            ("default_call_timeout", self.default_call_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        // Request ids are i32 on the wire and never reused within a stream.
        if self.total_requests_per_stream > i32::MAX as usize {
            return Err(ConfigError::TooLarge {
                field: "total_requests_per_stream",
                max: i32::MAX as u64,
            });
        }
        if self.low_watermark > self.high_watermark {
            return Err(ConfigError::Watermarks {
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }
        Ok(())
    }
}

impl ExecutorConfigOverride {
    fn apply(&self, config: &mut ExecutorConfig) -> Result<(), ConfigError> {
        if let Some(value) = self.max_channels
            && value > 0
        {
            config.max_channels = value;
        }
        if let Some(value) = self.max_concurrent_streams_per_channel
            && value > 0
        {
            config.max_concurrent_streams_per_channel = value;
        }
        if let Some(value) = self.max_concurrent_requests_per_stream
            && value > 0
        {
            config.max_concurrent_requests_per_stream = value;
        }
        if let Some(value) = self.total_requests_per_stream
            && value > 0
        {
            config.total_requests_per_stream = value;
        }
        if let Some(value) = self.max_batch_bytes
            && value > 0
        {
            config.max_batch_bytes = value;
        }
        if let Some(value) = self.max_bytes_per_stream
            && value > 0
        {
            config.max_bytes_per_stream = value;
        }
        if let Some(value) = self.max_stream_age_ms
            && value > 0
        {
            config.max_stream_age = Duration::from_millis(value);
        }
        if let Some(value) = self.max_queue_size
            && value > 0
        {
            config.max_queue_size = value;
        }
        if let Some(value) = self.queue_shards
            && value > 0
        {
            config.queue_shards = value;
        }
        if let Some(value) = self.poke_interval_ms
            && value > 0
        {
            config.poke_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.default_call_timeout_ms
            && value > 0
        {
            config.default_call_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            config.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.termination_wait_timeout_ms
            && value > 0
        {
            config.termination_wait_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            config.max_frame_bytes = value;
        }
        if let Some(value) = &self.selector {
            config.selector = Some(SelectorPolicy::parse(value)?);
        }
        if let Some(value) = self.low_watermark {
            config.low_watermark = value;
        }
        if let Some(value) = self.high_watermark
            && value > 0
        {
            config.high_watermark = value;
        }
        Ok(())
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_millis_env(key: &str) -> Option<Duration> {
    read_u64_env(key).map(Duration::from_millis)
}
