//! itembatch core library
//!
//! An in-process batching engine: producers write individual items, a pool of
//! workers accumulates them into bounded batches and hands each batch to a
//! pluggable exporter, flushing on batch size or batch timeout.
//!
//! - [`batcher`]: the processor, its queue, accumulator, workers and config
//! - [`exporter`]: the exporter capability batches are handed to
//! - [`metrics`]: Prometheus implementation of the metrics capability
//! - [`error`]: error taxonomy

pub mod batcher;
pub mod error;
pub mod exporter;
pub mod metrics;

pub use batcher::{
    BatchItemProcessor, BatchMetrics, BatchStats, ProcessorConfig, ProcessorState, ShippingMethod,
    WriteReceipt,
};
pub use error::{ConfigError, ExportError, ShutdownError, StartError, WriteError};
pub use exporter::ItemExporter;
