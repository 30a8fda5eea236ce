use crate::checksum::ChecksumAlgorithm;
use crate::session::PersistenceType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const MAX_THREADS_PER_JOB: usize = 16;

/// Progress event throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressThrottleConfig {
    /// Minimum gap between two throttled progress events (ms)
    pub interval_ms: u64,
    /// Exponential smoothing factor for the transfer rate, in (0, 1]
    pub smoothing: f64,
}

impl Default for ProgressThrottleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            smoothing: 0.3,
        }
    }
}

impl ProgressThrottleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Per-chunk retry and backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Capacity of the worker pool shared by every job
    pub pool_size: usize,
    pub default_threads: usize,
    pub retry: RetryConfig,
    pub progress_throttle: ProgressThrottleConfig,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub buffer_size: usize,
    pub user_agent: String,
    pub persistence_type: PersistenceType,
    pub persist_paused: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub debug: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            default_threads: 4,
            retry: RetryConfig::default(),
            progress_throttle: ProgressThrottleConfig::default(),
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            buffer_size: 64 * 1024,
            user_agent: crate::transport::USER_AGENT.to_string(),
            persistence_type: PersistenceType::JsonFile("downloads.json".into()),
            persist_paused: true,
            checksum_algorithm: ChecksumAlgorithm::MD5,
            debug: false,
        }
    }
}

/// Builder for [`DownloadConfig`]
#[derive(Debug, Clone, Default)]
pub struct DownloadConfigBuilder {
    inner: DownloadConfig,
}

impl DownloadConfigBuilder {
    pub fn new() -> Self {
        Self {
            inner: DownloadConfig::default(),
        }
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.inner.pool_size = n;
        self
    }

    pub fn default_threads(mut self, n: usize) -> Self {
        self.inner.default_threads = n;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.inner.retry = retry;
        self
    }

    pub fn progress_throttle(mut self, cfg: ProgressThrottleConfig) -> Self {
        self.inner.progress_throttle = cfg;
        self
    }

    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.inner.connect_timeout_secs = secs;
        self
    }

    pub fn read_timeout(mut self, secs: u64) -> Self {
        self.inner.read_timeout_secs = secs;
        self
    }

    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.inner.buffer_size = bytes;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.inner.user_agent = agent.into();
        self
    }

    pub fn persistence_type(mut self, p: PersistenceType) -> Self {
        self.inner.persistence_type = p;
        self
    }

    pub fn persist_paused(mut self, enable: bool) -> Self {
        self.inner.persist_paused = enable;
        self
    }

    pub fn checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.inner.checksum_algorithm = algorithm;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.inner.debug = debug;
        self
    }

    /// Validates and returns the configuration
    pub fn build(self) -> Result<DownloadConfig, DownloadConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[derive(Debug, Error)]
pub enum DownloadConfigError {
    #[error("Invalid pool size: {0}")]
    InvalidPoolSize(usize),
    #[error("Invalid number of threads: {0}")]
    InvalidThreads(usize),
    #[error("Invalid buffer size: {0}")]
    InvalidBufferSize(usize),
    #[error("Invalid retry policy: {0}")]
    InvalidRetry(String),
    #[error("Invalid progress throttle: {0}")]
    InvalidThrottle(String),
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), DownloadConfigError> {
        if self.pool_size == 0 || self.pool_size > 256 {
            return Err(DownloadConfigError::InvalidPoolSize(self.pool_size));
        }

        if self.default_threads == 0 || self.default_threads > MAX_THREADS_PER_JOB {
            return Err(DownloadConfigError::InvalidThreads(self.default_threads));
        }

        if self.buffer_size < 1024 {
            return Err(DownloadConfigError::InvalidBufferSize(self.buffer_size));
        }

        if self.retry.backoff_factor < 1.0 {
            return Err(DownloadConfigError::InvalidRetry(format!(
                "backoff factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            )));
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(DownloadConfigError::InvalidRetry(format!(
                "initial delay {}ms exceeds max delay {}ms",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }

        let smoothing = self.progress_throttle.smoothing;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            return Err(DownloadConfigError::InvalidThrottle(format!(
                "smoothing must be in (0, 1], got {}",
                smoothing
            )));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Loads configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, crate::DownloadError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

impl FromStr for DownloadConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}
