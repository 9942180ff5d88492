use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info};

use crate::{
    api::RemoteApi,
    storage::{
        payload_log::PayloadLog,
        session_store::{keys, SessionStore},
    },
};

use super::connectivity::Connectivity;

/// Payloads per batch request. The remote rejects request bodies above ~100KB.
pub const BATCH_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub payloads: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

/// Replays the offline payload log against the remote service.
pub struct BatchUploader {
    api: Arc<dyn RemoteApi>,
    store: Arc<SessionStore>,
    log: Arc<PayloadLog>,
    connectivity: Arc<Connectivity>,
}

impl BatchUploader {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: Arc<SessionStore>,
        log: Arc<PayloadLog>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        Self {
            api,
            store,
            log,
            connectivity,
        }
    }

    /// Drains the log and submits it in order, one batch at a time. Returns `None` without
    /// touching the log when the remote is unreachable.
    ///
    /// The log is gone before the first request goes out and failed batches are not queued
    /// again, so a payload is sent at most once.
    pub async fn flush(&self) -> Result<Option<FlushReport>> {
        if !self.connectivity.is_available().await {
            debug!("Remote service unavailable, keeping offline payloads");
            return Ok(None);
        }

        let payloads = self.log.drain_all().await?;
        let token = self.store.get_string(keys::JWT).await.unwrap_or_default();

        let mut report = FlushReport {
            payloads: payloads.len(),
            ..Default::default()
        };
        for batch in payloads.chunks(BATCH_LIMIT) {
            report.batches += 1;
            if let Err(e) = self.api.send_batch(&token, batch).await {
                report.failed_batches += 1;
                error!(
                    "Unable to send plugin data batch of {} payloads: {e:#}",
                    batch.len()
                );
            }
        }

        if report.payloads > 0 {
            info!("Flushed offline payloads {report:?}");
        }
        Ok(Some(report))
    }
}
