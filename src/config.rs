//! Redelivery configuration.
//!
//! One immutable [`RedeliveryConfig`] is built at startup and handed to the engine and the
//! consumer constructors. Build it in code with [`RedeliveryConfig::builder`] or load it from
//! JSON:
//!
//! ```rust
//! use redeliver::RedeliveryConfig;
//! use std::time::Duration;
//!
//! let config = RedeliveryConfig::from_json_str(r#"{
//!     "base_delay_ms": 1000,
//!     "backoff_factor": 2,
//!     "max_delay_ms": 60000,
//!     "source_destination": "orders",
//!     "error_destination": "orders.errors"
//! }"#).unwrap();
//! assert_eq!(config.backoff().next_delay(3), Duration::from_secs(8));
//! assert_eq!(config.capacity(), 1000);
//! ```

use crate::backoff::BackoffPolicy;
use crate::transport::Destination;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Header carrying the number of redeliveries already made.
pub const DEFAULT_RETRY_COUNT_HEADER: &str = "x-redelivery-count";
pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_FACTOR: u64 = 2;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_REPUBLISH_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_ERROR_SINK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors produced while building or loading a configuration.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The engine must be able to hold at least one envelope.
    #[error("capacity must be > 0")]
    ZeroCapacity,
    /// The ingest side must be allowed at least one message in flight.
    #[error("max_in_flight must be > 0")]
    ZeroInFlight,
    /// A required name was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
    /// A timeout or interval was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// The JSON document did not match the expected shape.
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings shared by the engine and the ingest side. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryConfig {
    base_delay: Duration,
    backoff_factor: u64,
    max_delay: Duration,
    capacity: usize,
    max_in_flight: Option<usize>,
    retry_count_header: String,
    source_destination: Destination,
    error_destination: Option<Destination>,
    republish_timeout: Duration,
    error_sink_timeout: Duration,
    poll_interval: Duration,
}

impl RedeliveryConfig {
    /// Start a builder for messages that are redelivered to `source_destination`.
    pub fn builder(source_destination: impl Into<Destination>) -> RedeliveryConfigBuilder {
        RedeliveryConfigBuilder::new(source_destination)
    }

    /// Parse a JSON document. Durations are given in milliseconds.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json)?;
        file.into_builder().build()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.backoff_factor)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn backoff_factor(&self) -> u64 {
        self.backoff_factor
    }

    /// Largest delay that is still scheduled; longer delays go to the error sink.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Failed messages taken off the source stream and not yet decided. Defaults to the
    /// engine capacity.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.unwrap_or(self.capacity)
    }

    pub fn retry_count_header(&self) -> &str {
        &self.retry_count_header
    }

    pub fn source_destination(&self) -> &Destination {
        &self.source_destination
    }

    pub fn error_destination(&self) -> Option<&Destination> {
        self.error_destination.as_ref()
    }

    pub fn republish_timeout(&self) -> Duration {
        self.republish_timeout
    }

    pub fn error_sink_timeout(&self) -> Duration {
        self.error_sink_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Builder for `RedeliveryConfig`.
#[derive(Debug, Clone)]
pub struct RedeliveryConfigBuilder {
    base_delay: Duration,
    backoff_factor: u64,
    max_delay: Duration,
    capacity: usize,
    max_in_flight: Option<usize>,
    retry_count_header: String,
    source_destination: Destination,
    error_destination: Option<Destination>,
    republish_timeout: Duration,
    error_sink_timeout: Duration,
    poll_interval: Duration,
}

impl RedeliveryConfigBuilder {
    pub fn new(source_destination: impl Into<Destination>) -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            capacity: DEFAULT_CAPACITY,
            max_in_flight: None,
            retry_count_header: DEFAULT_RETRY_COUNT_HEADER.to_string(),
            source_destination: source_destination.into(),
            error_destination: None,
            republish_timeout: DEFAULT_REPUBLISH_TIMEOUT,
            error_sink_timeout: DEFAULT_ERROR_SINK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: u64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = Some(limit);
        self
    }

    pub fn retry_count_header(mut self, header: impl Into<String>) -> Self {
        self.retry_count_header = header.into();
        self
    }

    /// Destination for messages past the delay threshold. An empty name means none.
    pub fn error_destination(mut self, destination: impl Into<Destination>) -> Self {
        let destination = destination.into();
        self.error_destination = (!destination.as_str().is_empty()).then_some(destination);
        self
    }

    pub fn republish_timeout(mut self, timeout: Duration) -> Self {
        self.republish_timeout = timeout;
        self
    }

    pub fn error_sink_timeout(mut self, timeout: Duration) -> Self {
        self.error_sink_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the configuration, validating inputs.
    pub fn build(self) -> Result<RedeliveryConfig, ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.max_in_flight == Some(0) {
            return Err(ConfigError::ZeroInFlight);
        }
        if self.retry_count_header.is_empty() {
            return Err(ConfigError::Empty("retry_count_header"));
        }
        if self.source_destination.as_str().is_empty() {
            return Err(ConfigError::Empty("source_destination"));
        }
        for (name, value) in [
            ("republish_timeout", self.republish_timeout),
            ("error_sink_timeout", self.error_sink_timeout),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(RedeliveryConfig {
            base_delay: self.base_delay,
            backoff_factor: self.backoff_factor,
            max_delay: self.max_delay,
            capacity: self.capacity,
            max_in_flight: self.max_in_flight,
            retry_count_header: self.retry_count_header,
            source_destination: self.source_destination,
            error_destination: self.error_destination,
            republish_timeout: self.republish_timeout,
            error_sink_timeout: self.error_sink_timeout,
            poll_interval: self.poll_interval,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    base_delay_ms: u64,
    backoff_factor: u64,
    max_delay_ms: u64,
    source_destination: String,
    #[serde(default)]
    error_destination: Option<String>,
    #[serde(default)]
    capacity: Option<usize>,
    #[serde(default)]
    max_in_flight: Option<usize>,
    #[serde(default)]
    retry_count_header: Option<String>,
    #[serde(default)]
    republish_timeout_ms: Option<u64>,
    #[serde(default)]
    error_sink_timeout_ms: Option<u64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
}

impl ConfigFile {
    fn into_builder(self) -> RedeliveryConfigBuilder {
        let mut builder = RedeliveryConfigBuilder::new(self.source_destination)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .backoff_factor(self.backoff_factor)
            .max_delay(Duration::from_millis(self.max_delay_ms));
        if let Some(destination) = self.error_destination {
            builder = builder.error_destination(destination);
        }
        if let Some(capacity) = self.capacity {
            builder = builder.capacity(capacity);
        }
        if let Some(limit) = self.max_in_flight {
            builder = builder.max_in_flight(limit);
        }
        if let Some(header) = self.retry_count_header {
            builder = builder.retry_count_header(header);
        }
        if let Some(ms) = self.republish_timeout_ms {
            builder = builder.republish_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.error_sink_timeout_ms {
            builder = builder.error_sink_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.poll_interval_ms {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        builder
    }
}
