//! Simulated exporter used by `itembatch run`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use itembatch_core::error::ExportError;
use itembatch_core::exporter::ItemExporter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exporter that sleeps for a fixed latency and fails every n-th batch
pub struct SimulatedExporter {
    latency: Duration,
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl SimulatedExporter {
    pub fn new(latency: Duration, fail_every: Option<u64>) -> Self {
        Self {
            latency,
            fail_every: fail_every.filter(|n| *n > 0),
            calls: AtomicU64::new(0),
        }
    }

    /// Number of export calls made so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ItemExporter<u64> for SimulatedExporter {
    async fn export_items(
        &self,
        cancel: &CancellationToken,
        items: &[Arc<u64>],
    ) -> Result<(), ExportError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;

        if !self.latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                _ = cancel.cancelled() => return Err(ExportError::Cancelled),
            }
        }

        if let Some(n) = self.fail_every {
            if call % n == 0 {
                return Err(ExportError::failed(format!(
                    "injected failure on batch {}",
                    call
                )));
            }
        }

        debug!(call, items = items.len(), "Simulated export");
        Ok(())
    }

    async fn shutdown(&self, _cancel: &CancellationToken) -> Result<(), ExportError> {
        debug!(calls = self.calls(), "Simulated exporter closed");
        Ok(())
    }
}
