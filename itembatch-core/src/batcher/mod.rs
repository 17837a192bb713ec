//! Batch item processor.
//!
//! Producers submit individual items; the processor accumulates them into
//! bounded batches and hands each batch to an [`ItemExporter`] running on a
//! pool of workers. A batch goes out when it reaches the size limit or when
//! its timeout elapses, whichever comes first.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Producers (write)                        │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │  Async: drop overflow
//!                              │  Sync:  wait for capacity
//!                     ┌────────▼────────┐
//!                     │    ItemQueue    │ ← bounded by max_queue_size
//!                     └───┬────┬────┬───┘
//!                         │    │    │
//!                 ┌───────▼┐ ┌─▼──────┐ ┌▼───────┐
//!                 │Worker 0│ │Worker 1│ │Worker N│ ← BatchAccumulator each
//!                 └───────┬┘ └─┬──────┘ └┬───────┘
//!                         │    │    │
//!                     ┌───▼────▼────▼───┐
//!                     │  ItemExporter   │ ← export_timeout per call
//!                     └─────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `Created → Started → Running → ShuttingDown → Stopped`. Shutdown closes
//! the queue, lets workers drain it (flushing partial batches), waits for
//! them up to a deadline, then calls the exporter's shutdown hook once.
//!
//! # Delivery
//!
//! At most once. A failed or timed out batch is counted as failed and is not
//! re-queued. There is no ordering guarantee across workers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use itembatch_core::batcher::{BatchItemProcessor, BatchStats, ProcessorConfig};
//! use itembatch_core::error::ExportError;
//! use itembatch_core::exporter::ItemExporter;
//! use tokio_util::sync::CancellationToken;
//!
//! struct StdoutExporter;
//!
//! #[async_trait]
//! impl ItemExporter<String> for StdoutExporter {
//!     async fn export_items(
//!         &self,
//!         _cancel: &CancellationToken,
//!         items: &[Arc<String>],
//!     ) -> Result<(), ExportError> {
//!         println!("exporting {} items", items.len());
//!         Ok(())
//!     }
//!
//!     async fn shutdown(&self, _cancel: &CancellationToken) -> Result<(), ExportError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ProcessorConfig::default()
//!     .with_max_export_batch_size(100)
//!     .with_batch_timeout(Duration::from_millis(500));
//! let processor = BatchItemProcessor::new("events", StdoutExporter, config, Arc::new(BatchStats::new()))?;
//!
//! let ctx = CancellationToken::new();
//! processor.start(&ctx).await?;
//! processor.write(&ctx, &[Arc::new("hello".to_string())]).await?;
//! processor.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod config;
mod metrics;
mod queue;
mod worker;

pub use accumulator::{BatchAccumulator, FlushTrigger};
pub use config::{ProcessorConfig, ShippingMethod};
pub use metrics::{BatchMetrics, BatchStats, ExportTimer, MetricsFanout, NoopMetrics, StatsSnapshot};
pub use queue::ItemQueue;
pub use worker::WorkerReport;

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

use crate::error::{ConfigError, ExportError, ShutdownError, StartError, WriteError};
use crate::exporter::ItemExporter;
use worker::{sleep_until_deadline, Pipeline, Worker};

/// Lifecycle state of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    /// Constructed; writes are queued but nothing drains them
    Created = 0,
    /// Workers are being spawned
    Started = 1,
    /// Workers are draining the queue
    Running = 2,
    /// Intake is closed and workers are draining
    ShuttingDown = 3,
    /// Terminal; the exporter has been shut down
    Stopped = 4,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessorState::Created,
            1 => ProcessorState::Started,
            2 => ProcessorState::Running,
            3 => ProcessorState::ShuttingDown,
            _ => ProcessorState::Stopped,
        }
    }

    /// Whether writes are still admitted
    pub fn accepts_writes(&self) -> bool {
        matches!(
            self,
            ProcessorState::Created | ProcessorState::Started | ProcessorState::Running
        )
    }
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorState::Created => write!(f, "Created"),
            ProcessorState::Started => write!(f, "Started"),
            ProcessorState::Running => write!(f, "Running"),
            ProcessorState::ShuttingDown => write!(f, "ShuttingDown"),
            ProcessorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Outcome of a successful `write`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Items placed on the queue
    pub accepted: usize,
    /// Items dropped because the queue was full (async shipping only)
    pub dropped: usize,
}

impl WriteReceipt {
    /// True when every item of the call was queued
    pub fn is_complete(&self) -> bool {
        self.dropped == 0
    }
}

/// Accumulates items into batches and exports them on a worker pool
pub struct BatchItemProcessor<T: Send + Sync + 'static> {
    pipeline: Arc<Pipeline<T>>,
    config: ProcessorConfig,
    state: AtomicU8,
    /// Worker handles. Lifecycle transitions happen with this lock held, so
    /// start and shutdown never interleave.
    workers: Mutex<Vec<JoinHandle<WorkerReport>>>,
    /// Child of the context passed to `start`; cancelling it stops every worker
    abort: OnceLock<CancellationToken>,
    span: Span,
}

impl<T: Send + Sync + 'static> BatchItemProcessor<T> {
    /// Create a processor.
    ///
    /// The configuration is validated before anything else is allocated; an
    /// invalid configuration yields no processor at all.
    pub fn new<E>(
        name: impl Into<String>,
        exporter: E,
        config: ProcessorConfig,
        metrics: Arc<dyn BatchMetrics>,
    ) -> Result<Self, ConfigError>
    where
        E: ItemExporter<T> + 'static,
    {
        config.validate()?;

        let name: Arc<str> = Arc::from(name.into());
        let span = info_span!("batch_processor", processor = %name);
        let pipeline = Arc::new(Pipeline {
            queue: ItemQueue::new(name.clone(), config.max_queue_size, metrics.clone()),
            name,
            exporter: Arc::new(exporter),
            metrics,
            max_export_batch_size: config.max_export_batch_size,
            batch_timeout: config.batch_timeout,
            export_timeout: config.export_timeout,
            held: AtomicUsize::new(0),
        });

        Ok(Self {
            pipeline,
            config,
            state: AtomicU8::new(ProcessorState::Created as u8),
            workers: Mutex::new(Vec::new()),
            abort: OnceLock::new(),
            span,
        })
    }

    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Get current queue depth
    pub async fn queue_depth(&self) -> usize {
        self.pipeline.queue.len().await
    }

    /// Whether the workers were stopped through the context given to `start`
    pub fn is_aborted(&self) -> bool {
        self.abort.get().is_some_and(CancellationToken::is_cancelled)
    }

    /// Spawn the worker pool on the current Tokio runtime.
    ///
    /// `ctx` is the processor's parent context: cancelling it aborts every
    /// worker, counting whatever they hold as failed, and makes further
    /// writes fail with [`WriteError::Shutdown`]. Call `shutdown` afterwards
    /// to account for queued items and close the exporter.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<(), StartError> {
        let mut handles = self.workers.lock().await;
        match self.state() {
            ProcessorState::Created => {}
            ProcessorState::Started | ProcessorState::Running => {
                return Err(StartError::AlreadyStarted)
            }
            ProcessorState::ShuttingDown | ProcessorState::Stopped => {
                return Err(StartError::Stopped)
            }
        }
        self.set_state(ProcessorState::Started);

        let abort = self.abort.get_or_init(|| ctx.child_token());
        for id in 0..self.config.workers {
            let worker = Worker::new(id, self.pipeline.clone(), abort.clone());
            let span = info_span!(parent: &self.span, "batch_worker", worker = id);
            handles.push(tokio::spawn(worker.run().instrument(span)));
        }
        self.pipeline
            .metrics
            .set_worker_count(&self.pipeline.name, self.config.workers);

        self.set_state(ProcessorState::Running);
        self.span.in_scope(|| {
            info!(
                workers = self.config.workers,
                max_queue_size = self.config.max_queue_size,
                max_export_batch_size = self.config.max_export_batch_size,
                shipping_method = %self.config.shipping_method,
                "Processor started"
            )
        });
        Ok(())
    }

    /// Submit items.
    ///
    /// With [`ShippingMethod::Async`] this never waits: the leading items that
    /// fit are queued and the rest are dropped and counted. With
    /// [`ShippingMethod::Sync`] it waits until the whole call fits, and queues
    /// nothing if `ctx` is cancelled first.
    ///
    /// Once shutdown has begun, or the context given to `start` has been
    /// cancelled, writes fail with [`WriteError::Shutdown`].
    pub async fn write(
        &self,
        ctx: &CancellationToken,
        items: &[Arc<T>],
    ) -> Result<WriteReceipt, WriteError> {
        if !self.state().accepts_writes() || self.is_aborted() {
            return Err(WriteError::Shutdown);
        }
        if items.is_empty() {
            return Ok(WriteReceipt::default());
        }

        match self.config.shipping_method {
            ShippingMethod::Async => {
                let accepted = self.pipeline.queue.offer(items).await?;
                let dropped = items.len() - accepted;
                if dropped > 0 {
                    self.pipeline
                        .metrics
                        .add_items_dropped(&self.pipeline.name, dropped);
                    self.span.in_scope(|| {
                        debug!(accepted, dropped, "Queue full, dropping items")
                    });
                }
                Ok(WriteReceipt { accepted, dropped })
            }
            ShippingMethod::Sync => {
                let push = self.pipeline.queue.push_all(items, ctx);
                match self.abort.get() {
                    Some(abort) => tokio::select! {
                        result = push => result?,
                        _ = abort.cancelled() => return Err(WriteError::Shutdown),
                    },
                    None => push.await?,
                }
                Ok(WriteReceipt { accepted: items.len(), dropped: 0 })
            }
        }
    }

    /// Stop intake, drain the queue and close the exporter.
    ///
    /// `timeout` bounds the whole drain; a timeout too large to represent
    /// waits as long as the workers need. If it elapses, workers are aborted,
    /// anything they held is counted as failed, anything still queued is
    /// counted as dropped, and [`ShutdownError::TimedOut`] is returned. A
    /// worker that panicked has its batch counted as failed and is reported
    /// through [`ShutdownError::WorkerPanicked`]. The exporter's shutdown hook
    /// runs exactly once in every case.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut handles = self.workers.lock().await;
        match self.state() {
            ProcessorState::Created | ProcessorState::Running => {}
            _ => return Err(ShutdownError::AlreadyShutdown),
        }
        self.set_state(ProcessorState::ShuttingDown);

        let queued = self.pipeline.queue.len().await;
        info!(queued, workers = handles.len(), "Shutting down processor");
        self.pipeline.queue.close().await;

        let join = futures::future::join_all(std::mem::take(&mut *handles));
        tokio::pin!(join);

        let drained = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, join.as_mut()).await.ok(),
            None => Some(join.as_mut().await),
        };
        let timed_out = drained.is_none();
        let results = match drained {
            Some(results) => results,
            None => {
                warn!(?timeout, "Drain deadline elapsed, aborting workers");
                if let Some(abort) = self.abort.get() {
                    abort.cancel();
                }
                join.as_mut().await
            }
        };

        let mut report = WorkerReport::default();
        let mut panicked = 0;
        for result in results {
            match result {
                Ok(worker_report) => report.merge(worker_report),
                Err(e) => {
                    panicked += 1;
                    error!(error = %e, "Worker task failed");
                }
            }
        }

        // Every surviving worker settled its items, so anything still held
        // was lost with a panicked worker.
        let lost = self.pipeline.held.swap(0, Ordering::AcqRel);
        if lost > 0 {
            self.pipeline.metrics.add_items_failed(&self.pipeline.name, lost);
            warn!(items = lost, "Counting items held by failed workers as failed");
        }

        let leftover = self.pipeline.queue.drain().await.len();
        if leftover > 0 {
            self.pipeline
                .metrics
                .add_items_dropped(&self.pipeline.name, leftover);
            warn!(items = leftover, "Dropping items left in queue");
        }
        self.pipeline.metrics.set_worker_count(&self.pipeline.name, 0);

        let exporter_result = self.shutdown_exporter(deadline).await;
        self.set_state(ProcessorState::Stopped);

        info!(
            batches = report.batches,
            exported = report.exported,
            failed = report.failed + lost,
            dropped = leftover,
            "Processor stopped"
        );

        if timed_out {
            return Err(ShutdownError::TimedOut {
                timeout,
                abandoned: leftover + report.abandoned + lost,
            });
        }
        if panicked > 0 {
            return Err(ShutdownError::WorkerPanicked { workers: panicked, lost });
        }
        exporter_result.map_err(ShutdownError::Exporter)
    }

    /// Call the exporter's shutdown hook, bounded by what is left of the deadline
    async fn shutdown_exporter(&self, deadline: Option<Instant>) -> Result<(), ExportError> {
        let cancel = CancellationToken::new();
        let result = tokio::select! {
            biased;

            result = self.pipeline.exporter.shutdown(&cancel) => result,

            _ = sleep_until_deadline(deadline) => {
                cancel.cancel();
                Err(ExportError::Cancelled)
            }
        };

        if let Err(e) = &result {
            warn!(error = %e, "Exporter shutdown failed");
        }
        result
    }
}

impl<T: Send + Sync + 'static> Drop for BatchItemProcessor<T> {
    fn drop(&mut self) {
        if self.state() == ProcessorState::Running {
            self.span
                .in_scope(|| warn!("Processor dropped without shutdown, aborting workers"));
            if let Some(abort) = self.abort.get() {
                abort.cancel();
            }
        }
    }
}
