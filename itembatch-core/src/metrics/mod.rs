//! Metrics backends for the batch item processor
//!
//! The processor only depends on the [`BatchMetrics`](crate::batcher::BatchMetrics)
//! trait; this module provides the Prometheus implementation.

pub mod prometheus;

pub use self::prometheus::{encode_metrics, exponential_buckets_range, PrometheusMetrics};
