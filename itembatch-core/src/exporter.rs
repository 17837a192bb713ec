//! Exporter capability.
//!
//! The processor hands every completed batch to an [`ItemExporter`]. The
//! exporter owns the expensive part (network calls, bulk writes) and reports
//! per-batch success or failure. Failed batches are counted, never retried.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ExportError;

/// Sink for batches of items
#[async_trait]
pub trait ItemExporter<T: Send + Sync + 'static>: Send + Sync {
    /// Export one batch.
    ///
    /// The processor cancels `cancel` once it stops waiting on the call:
    /// after it returns, when the export timeout elapses, or when the
    /// processor is aborted. In the last two cases the returned future has
    /// already been dropped, so only tasks the exporter spawned with a clone
    /// of the token ever observe the cancellation.
    async fn export_items(
        &self,
        cancel: &CancellationToken,
        items: &[Arc<T>],
    ) -> Result<(), ExportError>;

    /// Release exporter resources. Called exactly once, after all workers stopped.
    async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), ExportError>;
}

#[async_trait]
impl<T, E> ItemExporter<T> for Arc<E>
where
    T: Send + Sync + 'static,
    E: ItemExporter<T> + ?Sized,
{
    async fn export_items(
        &self,
        cancel: &CancellationToken,
        items: &[Arc<T>],
    ) -> Result<(), ExportError> {
        (**self).export_items(cancel, items).await
    }

    async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), ExportError> {
        (**self).shutdown(cancel).await
    }
}
