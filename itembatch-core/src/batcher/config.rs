//! Configuration for the batch item processor.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// How `write` behaves when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShippingMethod {
    /// Never block the producer; items that do not fit are dropped and counted
    #[default]
    Async,
    /// Block the producer until the whole write fits, or until it is cancelled
    Sync,
}

impl fmt::Display for ShippingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShippingMethod::Async => write!(f, "async"),
            ShippingMethod::Sync => write!(f, "sync"),
        }
    }
}

impl FromStr for ShippingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "async" => Ok(ShippingMethod::Async),
            "sync" => Ok(ShippingMethod::Sync),
            other => Err(format!("unknown shipping method '{}'", other)),
        }
    }
}

/// Configuration for the batch item processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Maximum number of items buffered between producers and workers
    pub max_queue_size: usize,

    /// Maximum number of items handed to the exporter in one call
    pub max_export_batch_size: usize,

    /// Maximum time a partial batch waits, measured from its first item
    pub batch_timeout: Duration,

    /// Deadline applied to every export call
    pub export_timeout: Duration,

    /// Number of concurrent export workers
    pub workers: usize,

    /// Overflow policy for `write`
    pub shipping_method: ShippingMethod,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 51_200,
            max_export_batch_size: 512,
            batch_timeout: Duration::from_secs(5),
            export_timeout: Duration::from_secs(30),
            workers: 5,
            shipping_method: ShippingMethod::Async,
        }
    }
}

impl ProcessorConfig {
    /// Create config optimized for low latency (small batches, short waits)
    pub fn low_latency() -> Self {
        Self {
            max_queue_size: 4_096,
            max_export_batch_size: 64,
            batch_timeout: Duration::from_millis(100),
            export_timeout: Duration::from_secs(5),
            workers: 2,
            shipping_method: ShippingMethod::Async,
        }
    }

    /// Create config optimized for high throughput (large batches, many workers)
    pub fn high_throughput() -> Self {
        Self {
            max_queue_size: 262_144,
            max_export_batch_size: 4_096,
            batch_timeout: Duration::from_secs(10),
            export_timeout: Duration::from_secs(60),
            workers: 16,
            shipping_method: ShippingMethod::Async,
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ITEMBATCH_MAX_QUEUE_SIZE") {
            if let Ok(n) = val.parse() {
                config.max_queue_size = n;
            }
        }

        if let Ok(val) = std::env::var("ITEMBATCH_MAX_EXPORT_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.max_export_batch_size = n;
            }
        }

        if let Ok(val) = std::env::var("ITEMBATCH_BATCH_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                config.batch_timeout = Duration::from_millis(n);
            }
        }

        if let Ok(val) = std::env::var("ITEMBATCH_EXPORT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                config.export_timeout = Duration::from_millis(n);
            }
        }

        if let Ok(val) = std::env::var("ITEMBATCH_WORKERS") {
            if let Ok(n) = val.parse() {
                config.workers = n;
            }
        }

        if let Ok(val) = std::env::var("ITEMBATCH_SHIPPING_METHOD") {
            if let Ok(method) = val.parse() {
                config.shipping_method = method;
            }
        }

        config
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_shipping_method(mut self, method: ShippingMethod) -> Self {
        self.shipping_method = method;
        self
    }

    /// Check the invariants every processor relies on for its whole lifetime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.max_export_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_export_batch_size > self.max_queue_size {
            return Err(ConfigError::BatchLargerThanQueue {
                batch: self.max_export_batch_size,
                queue: self.max_queue_size,
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "batch_timeout" });
        }
        if self.export_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "export_timeout" });
        }
        Ok(())
    }
}
