//! Prometheus metrics for the batch item processor
//!
//! Every metric carries a `processor` label so one [`PrometheusMetrics`]
//! instance can be shared by several processors. Metrics are registered into a
//! caller-owned [`Registry`]; nothing is registered globally.

use std::time::Duration;

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::batcher::BatchMetrics;

const PROCESSOR_LABEL: &str = "processor";

/// Prometheus-backed [`BatchMetrics`] sink
#[derive(Clone)]
pub struct PrometheusMetrics {
    items_queued: GaugeVec,
    items_dropped: CounterVec,
    items_failed: CounterVec,
    items_exported: CounterVec,
    export_duration: HistogramVec,
    batch_size: HistogramVec,
    worker_count: GaugeVec,
    worker_export_in_progress: GaugeVec,
}

impl PrometheusMetrics {
    /// Create the metric families under `<namespace>_processor`.
    ///
    /// An empty namespace yields plain `processor_*` names.
    pub fn new(namespace: &str) -> prometheus::Result<Self> {
        let namespace = if namespace.is_empty() {
            "processor".to_string()
        } else {
            format!("{}_processor", namespace)
        };
        let labels = &[PROCESSOR_LABEL];

        Ok(Self {
            items_queued: GaugeVec::new(
                Opts::new("items_queued", "Number of items queued").namespace(namespace.clone()),
                labels,
            )?,
            items_dropped: CounterVec::new(
                Opts::new("items_dropped_total", "Number of items dropped")
                    .namespace(namespace.clone()),
                labels,
            )?,
            items_failed: CounterVec::new(
                Opts::new("items_failed_total", "Number of items failed")
                    .namespace(namespace.clone()),
                labels,
            )?,
            items_exported: CounterVec::new(
                Opts::new("items_exported_total", "Number of items exported")
                    .namespace(namespace.clone()),
                labels,
            )?,
            export_duration: HistogramVec::new(
                HistogramOpts::new(
                    "export_duration_seconds",
                    "Duration of export operations in seconds",
                )
                .namespace(namespace.clone())
                .buckets(exponential_buckets(0.1, 2.0, 10)?),
                labels,
            )?,
            batch_size: HistogramVec::new(
                HistogramOpts::new("batch_size", "Size of processed batches")
                    .namespace(namespace.clone())
                    .buckets(exponential_buckets_range(1.0, 50_000.0, 10)?),
                labels,
            )?,
            worker_count: GaugeVec::new(
                Opts::new("worker_count", "Number of active workers").namespace(namespace.clone()),
                labels,
            )?,
            worker_export_in_progress: GaugeVec::new(
                Opts::new("worker_export_in_progress", "Number of workers currently exporting")
                    .namespace(namespace),
                labels,
            )?,
        })
    }

    /// Register all metric families with `registry`
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.items_queued.clone()))?;
        registry.register(Box::new(self.items_dropped.clone()))?;
        registry.register(Box::new(self.items_failed.clone()))?;
        registry.register(Box::new(self.items_exported.clone()))?;
        registry.register(Box::new(self.export_duration.clone()))?;
        registry.register(Box::new(self.batch_size.clone()))?;
        registry.register(Box::new(self.worker_count.clone()))?;
        registry.register(Box::new(self.worker_export_in_progress.clone()))?;
        Ok(())
    }

    /// Create and register in one step
    pub fn registered(namespace: &str, registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::new(namespace)?;
        metrics.register(registry)?;
        Ok(metrics)
    }
}

impl BatchMetrics for PrometheusMetrics {
    fn set_items_queued(&self, processor: &str, count: usize) {
        self.items_queued
            .with_label_values(&[processor])
            .set(count as f64);
    }

    fn add_items_dropped(&self, processor: &str, count: usize) {
        self.items_dropped
            .with_label_values(&[processor])
            .inc_by(count as f64);
    }

    fn add_items_exported(&self, processor: &str, count: usize) {
        self.items_exported
            .with_label_values(&[processor])
            .inc_by(count as f64);
    }

    fn add_items_failed(&self, processor: &str, count: usize) {
        self.items_failed
            .with_label_values(&[processor])
            .inc_by(count as f64);
    }

    fn observe_export_duration(&self, processor: &str, duration: Duration) {
        self.export_duration
            .with_label_values(&[processor])
            .observe(duration.as_secs_f64());
    }

    fn observe_batch_size(&self, processor: &str, size: usize) {
        self.batch_size
            .with_label_values(&[processor])
            .observe(size as f64);
    }

    fn set_worker_count(&self, processor: &str, count: usize) {
        self.worker_count
            .with_label_values(&[processor])
            .set(count as f64);
    }

    fn inc_export_in_progress(&self, processor: &str) {
        self.worker_export_in_progress
            .with_label_values(&[processor])
            .inc();
    }

    fn dec_export_in_progress(&self, processor: &str) {
        self.worker_export_in_progress
            .with_label_values(&[processor])
            .dec();
    }
}

/// `count` buckets growing by a constant factor from `min` to `max` inclusive
pub fn exponential_buckets_range(min: f64, max: f64, count: usize) -> prometheus::Result<Vec<f64>> {
    if count < 2 {
        return Err(prometheus::Error::Msg(format!(
            "exponential_buckets_range needs at least 2 buckets, got {}",
            count
        )));
    }
    if min <= 0.0 || max <= min {
        return Err(prometheus::Error::Msg(format!(
            "exponential_buckets_range needs 0 < min < max, got min={} max={}",
            min, max
        )));
    }

    let factor = (max / min).powf(1.0 / (count - 1) as f64);
    exponential_buckets(min, factor, count)
}

/// Encode all metrics in `registry` to Prometheus text format.
pub fn encode_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}
