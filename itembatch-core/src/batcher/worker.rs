//! Export workers.
//!
//! Each worker owns a [`BatchAccumulator`] and competes with the other
//! workers for items on the shared queue. A worker flushes its batch when it
//! fills up, when its timeout elapses, or when the queue is closed and empty,
//! then exits. Cancelling the abort token stops a worker immediately; whatever
//! it held is counted as failed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::accumulator::{BatchAccumulator, FlushTrigger};
use super::metrics::{BatchMetrics, ExportTimer};
use super::queue::ItemQueue;
use crate::error::ExportError;
use crate::exporter::ItemExporter;

/// State shared by the processor and all of its workers
pub(crate) struct Pipeline<T: Send + Sync + 'static> {
    pub name: Arc<str>,
    pub queue: ItemQueue<T>,
    pub exporter: Arc<dyn ItemExporter<T>>,
    pub metrics: Arc<dyn BatchMetrics>,
    pub max_export_batch_size: usize,
    pub batch_timeout: Duration,
    pub export_timeout: Duration,
    /// Items taken off the queue by workers and not yet counted as exported
    /// or failed. Whatever is left after every worker exits belongs to a
    /// worker that panicked.
    pub held: AtomicUsize,
}

/// What a worker did over its lifetime
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Batches handed to the exporter
    pub batches: usize,
    /// Items in batches the exporter accepted
    pub exported: usize,
    /// Items in batches that failed, timed out or were cancelled
    pub failed: usize,
    /// Items lost to an abort (also included in `failed`)
    pub abandoned: usize,
}

impl WorkerReport {
    pub fn merge(&mut self, other: WorkerReport) {
        self.batches += other.batches;
        self.exported += other.exported;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
    }
}

pub(crate) struct Worker<T: Send + Sync + 'static> {
    id: usize,
    pipeline: Arc<Pipeline<T>>,
    abort: CancellationToken,
    batch: BatchAccumulator<T>,
    report: WorkerReport,
}

impl<T: Send + Sync + 'static> Worker<T> {
    pub fn new(id: usize, pipeline: Arc<Pipeline<T>>, abort: CancellationToken) -> Self {
        let batch = BatchAccumulator::new(pipeline.max_export_batch_size, pipeline.batch_timeout);
        Self { id, pipeline, abort, batch, report: WorkerReport::default() }
    }

    /// Accumulate and export until the queue is closed and drained, or until aborted
    pub async fn run(mut self) -> WorkerReport {
        debug!(worker = self.id, "Worker started");
        let pipeline = self.pipeline.clone();

        loop {
            let deadline = self.batch.deadline();

            tokio::select! {
                biased;

                _ = self.abort.cancelled() => {
                    self.abandon_batch();
                    break;
                }

                _ = sleep_until_deadline(deadline) => {
                    if let Some(trigger) = self.batch.flush_trigger(Instant::now()) {
                        self.flush(trigger).await;
                    }
                }

                next = pipeline.queue.pop() => match next {
                    Some(item) => {
                        pipeline.held.fetch_add(1, Ordering::AcqRel);
                        self.batch.push(item);
                        if let Some(trigger) = self.batch.flush_trigger(Instant::now()) {
                            self.flush(trigger).await;
                        }
                    }
                    None => {
                        if !self.batch.is_empty() {
                            self.flush(FlushTrigger::Drain).await;
                        }
                        break;
                    }
                },
            }
        }

        debug!(
            worker = self.id,
            batches = self.report.batches,
            exported = self.report.exported,
            failed = self.report.failed,
            "Worker stopped"
        );
        self.report
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        let items = self.batch.take();
        let count = items.len();
        if count == 0 {
            return;
        }

        let pipeline = &self.pipeline;
        pipeline.metrics.observe_batch_size(&pipeline.name, count);

        let cancel = self.abort.child_token();
        let outcome = {
            let timer = ExportTimer::start(pipeline.metrics.as_ref(), &pipeline.name);
            let outcome = tokio::select! {
                biased;

                _ = self.abort.cancelled() => Err(ExportError::Cancelled),

                result = tokio::time::timeout(
                    pipeline.export_timeout,
                    pipeline.exporter.export_items(&cancel, &items),
                ) => match result {
                    Ok(result) => result,
                    Err(_) => Err(ExportError::TimedOut { timeout: pipeline.export_timeout }),
                },
            };
            debug!(
                worker = self.id,
                trigger = %trigger,
                items = count,
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "Export finished"
            );
            outcome
        };
        cancel.cancel();

        pipeline.held.fetch_sub(count, Ordering::AcqRel);
        self.report.batches += 1;
        match outcome {
            Ok(()) => {
                pipeline.metrics.add_items_exported(&pipeline.name, count);
                self.report.exported += count;
            }
            Err(err) => {
                pipeline.metrics.add_items_failed(&pipeline.name, count);
                self.report.failed += count;
                if matches!(err, ExportError::Cancelled) && self.abort.is_cancelled() {
                    self.report.abandoned += count;
                }
                warn!(
                    worker = self.id,
                    trigger = %trigger,
                    items = count,
                    error = %err,
                    "Batch export failed"
                );
            }
        }
    }

    fn abandon_batch(&mut self) {
        let count = self.batch.take().len();
        if count == 0 {
            return;
        }
        self.pipeline.held.fetch_sub(count, Ordering::AcqRel);
        self.pipeline.metrics.add_items_failed(&self.pipeline.name, count);
        self.report.failed += count;
        self.report.abandoned += count;
        warn!(worker = self.id, items = count, "Worker aborted with a partial batch");
    }
}

/// Resolves when `deadline` passes; never resolves without one
pub(super) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
