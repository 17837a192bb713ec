//! End-to-end tests for the batch item processor
//!
//! These drive a full processor against a mock exporter:
//! - size and timeout flush triggers
//! - configuration validation
//! - async (drop) and sync (backpressure) write paths
//! - shutdown drain, deadline and lifecycle errors

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use itembatch_core::batcher::{
    BatchItemProcessor, BatchStats, ProcessorConfig, ProcessorState, ShippingMethod,
};
use itembatch_core::error::{ConfigError, ExportError, ShutdownError, StartError, WriteError};
use itembatch_core::exporter::ItemExporter;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockExporter {
    exported: AtomicUsize,
    items: Mutex<Vec<u64>>,
    batch_sizes: Mutex<Vec<usize>>,
    shutdowns: AtomicUsize,
    delay: Option<Duration>,
    fail: bool,
    panic: bool,
}

impl MockExporter {
    fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Default::default() }
    }

    fn panicking() -> Self {
        Self { panic: true, ..Default::default() }
    }

    fn exported(&self) -> usize {
        self.exported.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemExporter<u64> for MockExporter {
    async fn export_items(
        &self,
        cancel: &CancellationToken,
        items: &[Arc<u64>],
    ) -> Result<(), ExportError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ExportError::Cancelled),
            }
        }

        if self.panic {
            panic!("exporter crashed on a batch of {}", items.len());
        }

        self.batch_sizes.lock().unwrap().push(items.len());
        if self.fail {
            return Err(ExportError::failed("sink rejected batch"));
        }

        self.items.lock().unwrap().extend(items.iter().map(|i| **i));
        self.exported.fetch_add(items.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, _cancel: &CancellationToken) -> Result<(), ExportError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn items(range: std::ops::Range<u64>) -> Vec<Arc<u64>> {
    range.map(Arc::new).collect()
}

fn processor(
    exporter: Arc<MockExporter>,
    config: ProcessorConfig,
) -> (BatchItemProcessor<u64>, Arc<BatchStats>) {
    let stats = Arc::new(BatchStats::new());
    let processor = BatchItemProcessor::new("test", exporter, config, stats.clone())
        .expect("valid config");
    (processor, stats)
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout_triggers_export() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_queue_size(1000)
        .with_max_export_batch_size(10)
        .with_batch_timeout(Duration::from_millis(100))
        .with_workers(1);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    let receipt = proc.write(&ctx, &items(0..5)).await.unwrap();
    assert_eq!(receipt.accepted, 5);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(exporter.exported(), 0, "batch flushed before its timeout");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(exporter.exported(), 5);
    assert_eq!(*exporter.batch_sizes.lock().unwrap(), vec![5]);

    proc.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(exporter.exported(), 5);
    assert_eq!(stats.snapshot().items_exported, 5);
}

#[tokio::test(start_paused = true)]
async fn test_batch_size_triggers_export() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_queue_size(1000)
        .with_max_export_batch_size(5)
        .with_batch_timeout(Duration::from_secs(10))
        .with_workers(1);
    let (proc, _) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..5)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(exporter.exported(), 5);

    proc.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(*exporter.batch_sizes.lock().unwrap(), vec![5]);
}

#[test]
fn test_invalid_config_creates_nothing() {
    let exporter = Arc::new(MockExporter::default());

    let result = BatchItemProcessor::<u64>::new(
        "test",
        exporter.clone(),
        ProcessorConfig::default()
            .with_max_queue_size(10)
            .with_max_export_batch_size(20),
        Arc::new(BatchStats::new()),
    );
    assert!(matches!(
        result,
        Err(ConfigError::BatchLargerThanQueue { batch: 20, queue: 10 })
    ));

    let result = BatchItemProcessor::<u64>::new(
        "test",
        exporter.clone(),
        ProcessorConfig::default().with_workers(0),
        Arc::new(BatchStats::new()),
    );
    assert!(matches!(result, Err(ConfigError::NoWorkers)));

    // Construction does not touch the runtime: no worker was spawned
    assert_eq!(Arc::strong_count(&exporter), 1);
}

#[tokio::test]
async fn test_shutdown_drains_everything() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_export_batch_size(64)
        .with_batch_timeout(Duration::from_secs(30))
        .with_workers(3);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    for chunk in 0..10 {
        proc.write(&ctx, &items(chunk * 100..chunk * 100 + 100)).await.unwrap();
    }

    proc.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(exporter.exported(), 1000);
    assert_eq!(proc.queue_depth().await, 0);
    assert_eq!(proc.state(), ProcessorState::Stopped);
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_exported, 1000);
    assert_eq!(snapshot.items_dropped, 0);
    assert_eq!(snapshot.items_failed, 0);
    assert_eq!(snapshot.items_queued, 0);
    assert_eq!(snapshot.workers, 0);
    assert_eq!(snapshot.exports_in_progress, 0);
}

#[tokio::test]
async fn test_export_errors_count_failed_without_retry() {
    let exporter = Arc::new(MockExporter::failing());
    let config = ProcessorConfig::default()
        .with_max_export_batch_size(4)
        .with_workers(2);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..10)).await.unwrap();
    proc.shutdown(Duration::from_secs(5)).await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_failed, 10);
    assert_eq!(snapshot.items_exported, 0);
    // Each item was attempted once
    let attempted: usize = exporter.batch_sizes.lock().unwrap().iter().sum();
    assert_eq!(attempted, 10);
}

#[tokio::test]
async fn test_async_overflow_drops_tail() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_queue_size(10)
        .with_max_export_batch_size(5)
        .with_shipping_method(ShippingMethod::Async);
    let (proc, stats) = processor(exporter.clone(), config);
    let ctx = CancellationToken::new();

    // Not started: nothing drains the queue
    let receipt = proc.write(&ctx, &items(0..15)).await.unwrap();
    assert_eq!(receipt.accepted, 10);
    assert_eq!(receipt.dropped, 5);
    assert!(!receipt.is_complete());
    assert_eq!(proc.queue_depth().await, 10);
    assert_eq!(stats.snapshot().items_dropped, 5);

    proc.start(&ctx).await.unwrap();
    proc.shutdown(Duration::from_secs(5)).await.unwrap();

    let mut exported = exporter.items.lock().unwrap().clone();
    exported.sort_unstable();
    assert_eq!(exported, (0..10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_sync_write_blocks_until_cancelled() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_queue_size(4)
        .with_max_export_batch_size(4)
        .with_shipping_method(ShippingMethod::Sync);
    let (proc, stats) = processor(exporter, config);

    let ctx = CancellationToken::new();
    proc.write(&ctx, &items(0..4)).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = proc.write(&cancel, &items(4..6)).await;
    assert_eq!(result, Err(WriteError::Cancelled));
    assert_eq!(proc.queue_depth().await, 4);
    assert_eq!(stats.snapshot().items_dropped, 0);
}

#[tokio::test]
async fn test_sync_write_resumes_when_workers_drain() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_queue_size(4)
        .with_max_export_batch_size(2)
        .with_batch_timeout(Duration::from_millis(20))
        .with_shipping_method(ShippingMethod::Sync)
        .with_workers(1);
    let (proc, _) = processor(exporter.clone(), config);
    let proc = Arc::new(proc);

    let ctx = CancellationToken::new();
    proc.write(&ctx, &items(0..4)).await.unwrap();

    let writer = {
        let proc = proc.clone();
        tokio::spawn(async move {
            let ctx = CancellationToken::new();
            proc.write(&ctx, &items(4..8)).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished(), "sync write must wait for capacity");

    proc.start(&ctx).await.unwrap();
    let receipt = writer.await.unwrap().unwrap();
    assert_eq!(receipt.accepted, 4);

    proc.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(exporter.exported(), 8);
}

#[tokio::test]
async fn test_shutdown_releases_blocked_sync_writer() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_queue_size(2)
        .with_max_export_batch_size(2)
        .with_shipping_method(ShippingMethod::Sync);
    let (proc, stats) = processor(exporter.clone(), config);
    let proc = Arc::new(proc);

    let ctx = CancellationToken::new();
    proc.write(&ctx, &items(0..2)).await.unwrap();

    let writer = {
        let proc = proc.clone();
        tokio::spawn(async move { proc.write(&CancellationToken::new(), &items(2..3)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Never started: the queued items cannot be exported
    proc.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(writer.await.unwrap(), Err(WriteError::Shutdown));
    assert_eq!(stats.snapshot().items_dropped, 2);
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sync_write_larger_than_queue_is_rejected() {
    let config = ProcessorConfig::default()
        .with_max_queue_size(4)
        .with_max_export_batch_size(4)
        .with_shipping_method(ShippingMethod::Sync);
    let (proc, _) = processor(Arc::new(MockExporter::default()), config);

    let result = proc.write(&CancellationToken::new(), &items(0..5)).await;
    assert_eq!(result, Err(WriteError::ExceedsCapacity { requested: 5, capacity: 4 }));
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let exporter = Arc::new(MockExporter::default());
    let (proc, _) = processor(exporter.clone(), ProcessorConfig::default().with_workers(2));
    let ctx = CancellationToken::new();

    assert_eq!(proc.state(), ProcessorState::Created);
    proc.start(&ctx).await.unwrap();
    assert_eq!(proc.state(), ProcessorState::Running);
    assert_eq!(proc.start(&ctx).await, Err(StartError::AlreadyStarted));

    proc.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(proc.state(), ProcessorState::Stopped);

    assert_eq!(proc.write(&ctx, &items(0..1)).await, Err(WriteError::Shutdown));
    assert!(matches!(
        proc.shutdown(Duration::from_secs(1)).await,
        Err(ShutdownError::AlreadyShutdown)
    ));
    assert_eq!(proc.start(&ctx).await, Err(StartError::Stopped));
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_deadline_abandons_and_counts() {
    let exporter = Arc::new(MockExporter::slow(Duration::from_secs(5)));
    let config = ProcessorConfig::default()
        .with_max_queue_size(10)
        .with_max_export_batch_size(1)
        .with_export_timeout(Duration::from_secs(30))
        .with_workers(1);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..3)).await.unwrap();

    let result = proc.shutdown(Duration::from_millis(100)).await;
    match result {
        Err(ShutdownError::TimedOut { timeout, abandoned }) => {
            assert_eq!(timeout, Duration::from_millis(100));
            assert_eq!(abandoned, 3);
        }
        other => panic!("expected shutdown timeout, got {:?}", other),
    }

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_exported, 0);
    assert_eq!(snapshot.items_failed, 1);
    assert_eq!(snapshot.items_dropped, 2);
    assert_eq!(snapshot.exports_in_progress, 0);
    assert_eq!(stats.items_accounted(), 3);
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(proc.state(), ProcessorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_export_timeout_fails_batch() {
    let exporter = Arc::new(MockExporter::slow(Duration::from_secs(5)));
    let config = ProcessorConfig::default()
        .with_max_export_batch_size(2)
        .with_export_timeout(Duration::from_millis(200))
        .with_workers(1);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stats.snapshot().items_failed, 2);

    proc.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(exporter.exported(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parent_context_cancellation_aborts_workers() {
    let exporter = Arc::new(MockExporter::slow(Duration::from_secs(1)));
    let config = ProcessorConfig::default()
        .with_max_export_batch_size(2)
        .with_workers(1);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..6)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    ctx.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    proc.shutdown(Duration::from_secs(1)).await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_failed, 2);
    assert_eq!(snapshot.items_dropped, 4);
    assert_eq!(stats.items_accounted(), 6);
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_export_each_item_once() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_queue_size(64)
        .with_max_export_batch_size(16)
        .with_batch_timeout(Duration::from_millis(20))
        .with_shipping_method(ShippingMethod::Sync)
        .with_workers(4);
    let (proc, stats) = processor(exporter.clone(), config);
    let proc = Arc::new(proc);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();

    let producers: Vec<_> = (0..8u64)
        .map(|p| {
            let proc = proc.clone();
            tokio::spawn(async move {
                let ctx = CancellationToken::new();
                for chunk in 0..25u64 {
                    let start = p * 1000 + chunk * 10;
                    proc.write(&ctx, &items(start..start + 10)).await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    proc.shutdown(Duration::from_secs(10)).await.unwrap();

    let exported = exporter.items.lock().unwrap().clone();
    let unique: HashSet<u64> = exported.iter().copied().collect();
    assert_eq!(exported.len(), 2000);
    assert_eq!(unique.len(), 2000);
    assert!(exporter.batch_sizes.lock().unwrap().iter().all(|&n| n >= 1 && n <= 16));

    let snapshot = stats.snapshot();
    assert!(snapshot.max_queue_depth <= 64);
    assert_eq!(snapshot.items_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_huge_batch_timeout_flushes_on_drain() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_export_batch_size(10)
        .with_batch_timeout(Duration::MAX)
        .with_workers(1);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(exporter.exported(), 0);

    proc.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(exporter.exported(), 2);
    assert_eq!(stats.items_accounted(), 2);
}

#[tokio::test]
async fn test_unbounded_shutdown_deadline() {
    let exporter = Arc::new(MockExporter::default());
    let config = ProcessorConfig::default()
        .with_max_export_batch_size(8)
        .with_workers(2);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..20)).await.unwrap();

    proc.shutdown(Duration::MAX).await.unwrap();

    assert_eq!(proc.state(), ProcessorState::Stopped);
    assert_eq!(exporter.exported(), 20);
    assert_eq!(stats.items_accounted(), 20);
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicked_worker_items_are_counted() {
    let exporter = Arc::new(MockExporter::panicking());
    let config = ProcessorConfig::default()
        .with_max_export_batch_size(2)
        .with_workers(1);
    let (proc, stats) = processor(exporter.clone(), config);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..4)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = proc.shutdown(Duration::from_secs(1)).await;
    assert!(
        matches!(result, Err(ShutdownError::WorkerPanicked { workers: 1, lost: 2 })),
        "unexpected shutdown result: {:?}",
        result
    );

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_failed, 2);
    assert_eq!(snapshot.items_dropped, 2);
    assert_eq!(snapshot.exports_in_progress, 0);
    assert_eq!(stats.items_accounted(), 4);
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_writes_rejected_after_parent_cancellation() {
    let exporter = Arc::new(MockExporter::slow(Duration::from_secs(10)));
    let config = ProcessorConfig::default()
        .with_max_queue_size(2)
        .with_max_export_batch_size(2)
        .with_shipping_method(ShippingMethod::Sync)
        .with_workers(1);
    let (proc, stats) = processor(exporter.clone(), config);
    let proc = Arc::new(proc);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();
    proc.write(&ctx, &items(0..2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    // The worker is exporting the first batch, so the queue has room again
    proc.write(&ctx, &items(2..4)).await.unwrap();

    let writer = {
        let proc = proc.clone();
        tokio::spawn(async move { proc.write(&CancellationToken::new(), &items(4..6)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!writer.is_finished());

    ctx.cancel();
    assert_eq!(writer.await.unwrap(), Err(WriteError::Shutdown));
    assert!(proc.is_aborted());
    assert_eq!(proc.write(&ctx, &items(6..7)).await, Err(WriteError::Shutdown));
    assert_eq!(proc.queue_depth().await, 2);

    proc.shutdown(Duration::from_secs(1)).await.unwrap();
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_failed, 2);
    assert_eq!(snapshot.items_dropped, 2);
    assert_eq!(stats.items_accounted(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_async_producers_stay_bounded() {
    let exporter = Arc::new(MockExporter::slow(Duration::from_millis(1)));
    let config = ProcessorConfig::default()
        .with_max_queue_size(32)
        .with_max_export_batch_size(8)
        .with_batch_timeout(Duration::from_millis(20))
        .with_shipping_method(ShippingMethod::Async)
        .with_workers(2);
    let (proc, stats) = processor(exporter.clone(), config);
    let proc = Arc::new(proc);

    let ctx = CancellationToken::new();
    proc.start(&ctx).await.unwrap();

    let producers: Vec<_> = (0..8u64)
        .map(|p| {
            let proc = proc.clone();
            tokio::spawn(async move {
                let ctx = CancellationToken::new();
                let (mut accepted, mut dropped) = (0, 0);
                for chunk in 0..50u64 {
                    let start = p * 1000 + chunk * 10;
                    let receipt = proc.write(&ctx, &items(start..start + 10)).await.unwrap();
                    accepted += receipt.accepted;
                    dropped += receipt.dropped;
                }
                (accepted, dropped)
            })
        })
        .collect();

    let (mut accepted, mut dropped) = (0, 0);
    for producer in producers {
        let (a, d) = producer.await.unwrap();
        accepted += a;
        dropped += d;
    }

    proc.shutdown(Duration::from_secs(10)).await.unwrap();

    assert_eq!(accepted + dropped, 4000);
    assert_eq!(exporter.exported(), accepted);

    let snapshot = stats.snapshot();
    assert!(snapshot.max_queue_depth <= 32);
    assert_eq!(snapshot.items_dropped, dropped as u64);
    assert_eq!(snapshot.items_exported + snapshot.items_dropped, 4000);
}
