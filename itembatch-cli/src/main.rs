use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use itembatch_core::batcher::{
    BatchItemProcessor, BatchMetrics, BatchStats, MetricsFanout, ProcessorConfig, ShippingMethod,
};
use itembatch_core::error::{ShutdownError, WriteError};
use itembatch_core::metrics::{encode_metrics, PrometheusMetrics};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod simulate;

use simulate::SimulatedExporter;

/// Items submitted per `write` call by each producer
const WRITE_CHUNK: usize = 32;

#[derive(Parser)]
#[command(name = "itembatch")]
#[command(version = "0.1.0")]
#[command(about = "itembatch - In-process item batching engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration (environment + defaults)
    Config,

    /// Push synthetic items through a processor with a simulated exporter
    Run {
        /// Total number of items to write
        #[arg(short = 'n', long, default_value_t = 10_000)]
        items: u64,

        /// Number of concurrent producers
        #[arg(short, long, default_value_t = 4)]
        producers: u64,

        /// Simulated export latency per batch
        #[arg(long, default_value_t = 5)]
        export_latency_ms: u64,

        /// Fail every n-th export call
        #[arg(long)]
        fail_every: Option<u64>,

        /// Number of export workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Maximum items per exported batch
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Maximum items buffered in the queue
        #[arg(short, long)]
        queue_size: Option<usize>,

        /// Maximum time a partial batch waits before export
        #[arg(long)]
        batch_timeout_ms: Option<u64>,

        /// Block producers when the queue is full instead of dropping items
        #[arg(long)]
        sync: bool,

        /// Drain deadline for shutdown
        #[arg(long, default_value_t = 30_000)]
        shutdown_timeout_ms: u64,

        /// Also print metrics in Prometheus text format
        #[arg(long)]
        prometheus: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine readable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("itembatch=info,itembatch_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            let config = ProcessorConfig::from_env();

            println!("=== Processor Configuration ===");
            print_config(&config);
            println!();

            match config.validate() {
                Ok(()) => println!("✓ Configuration is valid"),
                Err(e) => {
                    println!("❌ Configuration is invalid: {}", e);
                    anyhow::bail!("invalid configuration: {}", e);
                }
            }
        }

        Commands::Run {
            items,
            producers,
            export_latency_ms,
            fail_every,
            workers,
            batch_size,
            queue_size,
            batch_timeout_ms,
            sync,
            shutdown_timeout_ms,
            prometheus,
        } => {
            let mut config = ProcessorConfig::from_env();
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if let Some(size) = batch_size {
                config = config.with_max_export_batch_size(size);
            }
            if let Some(size) = queue_size {
                config = config.with_max_queue_size(size);
            }
            if let Some(ms) = batch_timeout_ms {
                config = config.with_batch_timeout(Duration::from_millis(ms));
            }
            if sync {
                config = config.with_shipping_method(ShippingMethod::Sync);
            }

            let registry = Registry::new();
            let stats = Arc::new(BatchStats::new());
            let mut metrics = MetricsFanout::new().with(stats.clone());
            if prometheus {
                let prom = PrometheusMetrics::registered("itembatch", &registry)
                    .context("Failed to register Prometheus metrics")?;
                metrics = metrics.with(Arc::new(prom));
            }
            let metrics: Arc<dyn BatchMetrics> = Arc::new(metrics);

            let exporter = Arc::new(SimulatedExporter::new(
                Duration::from_millis(export_latency_ms),
                fail_every,
            ));
            let processor = Arc::new(
                BatchItemProcessor::new("cli", exporter.clone(), config.clone(), metrics)
                    .context("Failed to create processor")?,
            );

            let ctx = CancellationToken::new();
            {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, cancelling producers and workers");
                        ctx.cancel();
                    }
                });
            }

            processor.start(&ctx).await.context("Failed to start processor")?;

            let started = Instant::now();
            let written = produce(&processor, &ctx, items, producers.max(1)).await?;
            let write_elapsed = started.elapsed();

            info!(written, elapsed_ms = write_elapsed.as_millis() as u64, "Producers finished");

            let shutdown = processor
                .shutdown(Duration::from_millis(shutdown_timeout_ms))
                .await;
            let total_elapsed = started.elapsed();

            let report = serde_json::json!({
                "config": {
                    "max_queue_size": config.max_queue_size,
                    "max_export_batch_size": config.max_export_batch_size,
                    "batch_timeout_ms": config.batch_timeout.as_millis() as u64,
                    "export_timeout_ms": config.export_timeout.as_millis() as u64,
                    "workers": config.workers,
                    "shipping_method": config.shipping_method.to_string(),
                },
                "items_requested": items,
                "items_written": written,
                "export_calls": exporter.calls(),
                "elapsed_ms": total_elapsed.as_millis() as u64,
                "stats": stats.snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);

            if prometheus {
                println!();
                println!("# Prometheus metrics");
                print!("{}", encode_metrics(&registry));
            }

            match shutdown {
                Ok(()) => {}
                Err(ShutdownError::Exporter(e)) => {
                    warn!(error = %e, "Exporter shutdown failed");
                }
                Err(e) => return Err(e).context("Processor did not shut down cleanly"),
            }
        }
    }

    Ok(())
}

fn print_config(config: &ProcessorConfig) {
    println!("max_queue_size: {}", config.max_queue_size);
    println!("max_export_batch_size: {}", config.max_export_batch_size);
    println!("batch_timeout: {:?}", config.batch_timeout);
    println!("export_timeout: {:?}", config.export_timeout);
    println!("workers: {}", config.workers);
    println!("shipping_method: {}", config.shipping_method);
}

/// Split `items` ids across `producers` tasks and write them in chunks.
///
/// Returns the number of items the processor accepted.
async fn produce(
    processor: &Arc<BatchItemProcessor<u64>>,
    ctx: &CancellationToken,
    items: u64,
    producers: u64,
) -> anyhow::Result<u64> {
    let per_producer = items.div_ceil(producers);
    let chunk = WRITE_CHUNK.min(processor.config().max_queue_size);

    let mut handles = Vec::with_capacity(producers as usize);
    for p in 0..producers {
        let start = (p * per_producer).min(items);
        let end = ((p + 1) * per_producer).min(items);
        let processor = processor.clone();
        let ctx = ctx.clone();

        handles.push(tokio::spawn(async move {
            let ids: Vec<Arc<u64>> = (start..end).map(Arc::new).collect();
            let mut accepted = 0u64;
            for batch in ids.chunks(chunk) {
                match processor.write(&ctx, batch).await {
                    Ok(receipt) => accepted += receipt.accepted as u64,
                    Err(WriteError::Cancelled | WriteError::Shutdown) => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(accepted)
        }));
    }

    let mut written = 0;
    for handle in handles {
        written += handle.await.context("Producer task panicked")??;
    }
    Ok(written)
}
