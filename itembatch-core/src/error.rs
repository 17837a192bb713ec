//! Error types for the itembatch engine.
//!
//! Errors are grouped by the point in the processor lifecycle where they
//! surface:
//!
//! ```text
//! ConfigError    - construction (no processor is created)
//! StartError     - start()
//! WriteError     - write() admission
//! ShutdownError  - shutdown()
//! ExportError    - returned by exporters, only ever seen through metrics/logs
//! ```
//!
//! Applications embedding the processor are expected to wrap these with
//! `anyhow` context, the way the `itembatch` binary does.

use std::time::Duration;

use thiserror::Error;

/// Invalid processor configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Queue capacity must hold at least one item
    #[error("max queue size must be at least 1")]
    ZeroQueueSize,

    /// Batches must hold at least one item
    #[error("max export batch size must be at least 1")]
    ZeroBatchSize,

    /// A batch can never be larger than the queue feeding it
    #[error("max export batch size ({batch}) exceeds max queue size ({queue})")]
    BatchLargerThanQueue { batch: usize, queue: usize },

    /// At least one worker is required to drain the queue
    #[error("worker count must be at least 1")]
    NoWorkers,

    /// Timeouts must be positive
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

/// Errors returned by `start`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("processor already started")]
    AlreadyStarted,

    #[error("processor is shut down")]
    Stopped,
}

/// Admission errors returned by `write`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The processor is shutting down or stopped
    #[error("processor is shut down")]
    Shutdown,

    /// The caller's cancellation fired before queue capacity freed up
    #[error("write cancelled while waiting for queue capacity")]
    Cancelled,

    /// Synchronous writes are all-or-nothing, so a call larger than the queue
    /// can never be admitted
    #[error("write of {requested} items exceeds queue capacity ({capacity})")]
    ExceedsCapacity { requested: usize, capacity: usize },
}

/// Errors returned by `shutdown`
#[derive(Error, Debug)]
pub enum ShutdownError {
    /// Shutdown already ran (or is running) on this processor
    #[error("processor already shut down")]
    AlreadyShutdown,

    /// Workers did not finish draining before the deadline
    #[error("shutdown timed out after {timeout:?}; {abandoned} items abandoned")]
    TimedOut { timeout: Duration, abandoned: usize },

    /// Worker tasks panicked; the items they held were counted as failed
    #[error("{workers} worker(s) panicked; {lost} items lost")]
    WorkerPanicked { workers: usize, lost: usize },

    /// Drain completed but the exporter's own shutdown hook failed
    #[error("exporter shutdown failed: {0}")]
    Exporter(#[source] ExportError),
}

/// Errors reported by an [`ItemExporter`](crate::exporter::ItemExporter)
#[derive(Error, Debug)]
pub enum ExportError {
    /// The sink rejected the batch
    #[error("export failed: {0}")]
    Failed(String),

    /// The export call ran past the configured export timeout
    #[error("export timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    /// The export was abandoned because the processor was aborted
    #[error("export cancelled")]
    Cancelled,

    /// Underlying client error
    #[error("exporter backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ExportError {
    /// Create a generic export failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Wrap a client error
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}
