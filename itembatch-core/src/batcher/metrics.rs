//! Metrics capability consumed by the batch item processor.
//!
//! The processor never talks to a metrics backend directly. It is handed an
//! `Arc<dyn BatchMetrics>` at construction and calls it at fixed points.
//! [`BatchStats`] keeps in-process counters, [`PrometheusMetrics`] exports to
//! a Prometheus registry, and [`MetricsFanout`] feeds several sinks at once.
//!
//! [`PrometheusMetrics`]: crate::metrics::PrometheusMetrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Instrumentation points of the processor.
///
/// Every call carries the processor name so a single sink can serve many
/// processors. Implementations must be safe to call from all workers at once.
pub trait BatchMetrics: Send + Sync {
    /// Queue depth after a change
    fn set_items_queued(&self, processor: &str, count: usize);

    /// Items dropped on overflow or abandoned at shutdown
    fn add_items_dropped(&self, processor: &str, count: usize);

    /// Items in batches the exporter accepted
    fn add_items_exported(&self, processor: &str, count: usize);

    /// Items in batches that failed or timed out
    fn add_items_failed(&self, processor: &str, count: usize);

    fn observe_export_duration(&self, processor: &str, duration: Duration);

    fn observe_batch_size(&self, processor: &str, size: usize);

    fn set_worker_count(&self, processor: &str, count: usize);

    fn inc_export_in_progress(&self, processor: &str);

    fn dec_export_in_progress(&self, processor: &str);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl BatchMetrics for NoopMetrics {
    fn set_items_queued(&self, _: &str, _: usize) {}
    fn add_items_dropped(&self, _: &str, _: usize) {}
    fn add_items_exported(&self, _: &str, _: usize) {}
    fn add_items_failed(&self, _: &str, _: usize) {}
    fn observe_export_duration(&self, _: &str, _: Duration) {}
    fn observe_batch_size(&self, _: &str, _: usize) {}
    fn set_worker_count(&self, _: &str, _: usize) {}
    fn inc_export_in_progress(&self, _: &str) {}
    fn dec_export_in_progress(&self, _: &str) {}
}

/// In-process counters, aggregated across every processor that reports here
#[derive(Debug, Default)]
pub struct BatchStats {
    /// Items currently in the queue
    pub items_queued: AtomicU64,

    /// Maximum queue depth observed
    pub max_queue_depth: AtomicU64,

    /// Items dropped on overflow or abandoned at shutdown
    pub items_dropped: AtomicU64,

    /// Items exported successfully
    pub items_exported: AtomicU64,

    /// Items in failed batches
    pub items_failed: AtomicU64,

    /// Number of batches flushed
    pub batches: AtomicU64,

    /// Total items in flushed batches (for batch size averaging)
    pub total_batch_items: AtomicU64,

    /// Total export time in microseconds (for averaging)
    pub total_export_micros: AtomicU64,

    /// Number of export calls timed
    pub exports_timed: AtomicU64,

    /// Active workers
    pub workers: AtomicU64,

    /// Workers currently inside an export call
    pub exports_in_progress: AtomicU64,
}

impl BatchStats {
    /// Create new stats instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Items exported plus failed plus dropped
    pub fn items_accounted(&self) -> u64 {
        self.items_exported.load(Ordering::Relaxed)
            + self.items_failed.load(Ordering::Relaxed)
            + self.items_dropped.load(Ordering::Relaxed)
    }

    /// Calculate average batch size
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.total_batch_items.load(Ordering::Relaxed) as f64 / batches as f64
    }

    /// Calculate average export time in milliseconds
    pub fn avg_export_ms(&self) -> f64 {
        let timed = self.exports_timed.load(Ordering::Relaxed);
        if timed == 0 {
            return 0.0;
        }
        self.total_export_micros.load(Ordering::Relaxed) as f64 / timed as f64 / 1000.0
    }

    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            items_queued: self.items_queued.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
            items_exported: self.items_exported.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            avg_batch_size: self.avg_batch_size(),
            avg_export_ms: self.avg_export_ms(),
            workers: self.workers.load(Ordering::Relaxed),
            exports_in_progress: self.exports_in_progress.load(Ordering::Relaxed),
        }
    }
}

impl BatchMetrics for BatchStats {
    fn set_items_queued(&self, _: &str, count: usize) {
        let count = count as u64;
        self.items_queued.store(count, Ordering::Relaxed);
        self.max_queue_depth.fetch_max(count, Ordering::Relaxed);
    }

    fn add_items_dropped(&self, _: &str, count: usize) {
        self.items_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn add_items_exported(&self, _: &str, count: usize) {
        self.items_exported.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn add_items_failed(&self, _: &str, count: usize) {
        self.items_failed.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn observe_export_duration(&self, _: &str, duration: Duration) {
        self.exports_timed.fetch_add(1, Ordering::Relaxed);
        self.total_export_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    fn observe_batch_size(&self, _: &str, size: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.total_batch_items.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn set_worker_count(&self, _: &str, count: usize) {
        self.workers.store(count as u64, Ordering::Relaxed);
    }

    fn inc_export_in_progress(&self, _: &str) {
        self.exports_in_progress.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_export_in_progress(&self, _: &str) {
        self.exports_in_progress.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of [`BatchStats`] at a point in time
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StatsSnapshot {
    pub items_queued: u64,
    pub max_queue_depth: u64,
    pub items_dropped: u64,
    pub items_exported: u64,
    pub items_failed: u64,
    pub batches: u64,
    pub avg_batch_size: f64,
    pub avg_export_ms: f64,
    pub workers: u64,
    pub exports_in_progress: u64,
}

/// Forwards every call to each wrapped sink
#[derive(Default, Clone)]
pub struct MetricsFanout {
    sinks: Vec<Arc<dyn BatchMetrics>>,
}

impl MetricsFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn BatchMetrics>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl BatchMetrics for MetricsFanout {
    fn set_items_queued(&self, processor: &str, count: usize) {
        self.sinks.iter().for_each(|s| s.set_items_queued(processor, count));
    }

    fn add_items_dropped(&self, processor: &str, count: usize) {
        self.sinks.iter().for_each(|s| s.add_items_dropped(processor, count));
    }

    fn add_items_exported(&self, processor: &str, count: usize) {
        self.sinks.iter().for_each(|s| s.add_items_exported(processor, count));
    }

    fn add_items_failed(&self, processor: &str, count: usize) {
        self.sinks.iter().for_each(|s| s.add_items_failed(processor, count));
    }

    fn observe_export_duration(&self, processor: &str, duration: Duration) {
        self.sinks
            .iter()
            .for_each(|s| s.observe_export_duration(processor, duration));
    }

    fn observe_batch_size(&self, processor: &str, size: usize) {
        self.sinks.iter().for_each(|s| s.observe_batch_size(processor, size));
    }

    fn set_worker_count(&self, processor: &str, count: usize) {
        self.sinks.iter().for_each(|s| s.set_worker_count(processor, count));
    }

    fn inc_export_in_progress(&self, processor: &str) {
        self.sinks.iter().for_each(|s| s.inc_export_in_progress(processor));
    }

    fn dec_export_in_progress(&self, processor: &str) {
        self.sinks.iter().for_each(|s| s.dec_export_in_progress(processor));
    }
}

/// Tracks one export call.
///
/// Marks the export as in progress on creation. Dropping the timer, on any
/// path out of the export, records the duration and clears the in-progress
/// mark.
pub struct ExportTimer<'a> {
    metrics: &'a dyn BatchMetrics,
    processor: &'a str,
    start: Instant,
}

impl<'a> ExportTimer<'a> {
    pub fn start(metrics: &'a dyn BatchMetrics, processor: &'a str) -> Self {
        metrics.inc_export_in_progress(processor);
        Self { metrics, processor, start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ExportTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .observe_export_duration(self.processor, self.start.elapsed());
        self.metrics.dec_export_in_progress(self.processor);
    }
}
