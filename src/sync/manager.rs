//! # Sync Manager
//!
//! Uploads locally captured records with a bounded retry budget and a
//! persisted progress cursor.
//!
//! Delivery is **at-least-once**: the cursor advances only after the server
//! confirms an upload, so a crash between confirmation and cursor write
//! re-sends that batch on the next run. Deduplication is the receiver's job.
//!
//! The manager keeps no lock of its own around a sync run. Callers must not
//! run two syncs for the same state key at once; hosting it as one
//! serialized scheduler job satisfies that.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::cursor::CursorStore;
use super::record::RecordStore;
use super::transport::{UploadBatch, UploadTransport};
use crate::error::{AgentError, Result};

/// Retry and scoping parameters for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Additional attempts after the first.
    pub retries: u32,
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
    /// Only upload these sequence numbers; `None` uploads everything.
    pub row_range: Option<RangeInclusive<u64>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            row_range: None,
        }
    }
}

impl SyncOptions {
    pub fn with_row_range(mut self, range: RangeInclusive<u64>) -> Self {
        self.row_range = Some(range);
        self
    }

    /// Attempts made before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Result of a confirmed upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub records_sent: usize,
    /// Highest sequence number in the batch; `None` when nothing was sent.
    pub last_seq: Option<u64>,
    pub attempts: u32,
    /// Count reported by the server, if any.
    pub server_uploaded: Option<u64>,
}

/// Uploads records and tracks per-source progress.
pub struct SyncManager {
    transport: Arc<dyn UploadTransport>,
    cursors: CursorStore,
    options: SyncOptions,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("cursors", &self.cursors)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    /// Creates a manager; `options` are used by [`sync_new_records`](Self::sync_new_records).
    pub fn new(transport: Arc<dyn UploadTransport>, cursors: CursorStore, options: SyncOptions) -> Self {
        Self {
            transport,
            cursors,
            options,
        }
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Uploads the records of `source` to `endpoint`.
    ///
    /// Makes up to `retries + 1` attempts, each bounded by `timeout` and
    /// separated by `retry_delay`. A timed-out attempt, a transport error and
    /// a non-success status all count the same against the budget.
    ///
    /// # Returns
    ///
    /// The confirmed upload. A source with nothing in scope returns an
    /// outcome with `records_sent == 0` and makes no network call.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::SyncFailed`] once every attempt has failed, or
    /// the store's error if the records cannot be read.
    pub async fn sync_database_to_server(
        &self,
        source: &dyn RecordStore,
        endpoint: &str,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        let records = match &options.row_range {
            Some(range) => source.load_range(range.clone()).await?,
            None => source.load_since(0).await?,
        };

        let Some(batch) = UploadBatch::from_records(source.name(), &records)? else {
            debug!(source = source.name(), "Nothing to upload");
            return Ok(SyncOutcome::default());
        };

        let max_attempts = options.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(options.timeout, self.transport.upload(endpoint, &batch)).await {
                Ok(Ok(receipt)) if receipt.is_success() => {
                    info!(
                        source = %batch.source,
                        endpoint,
                        first_seq = batch.first_seq,
                        last_seq = batch.last_seq,
                        records = batch.record_count,
                        attempt,
                        "Records synced"
                    );
                    if let Some(reported) = receipt.uploaded {
                        info!(reported, "Server reported uploaded count");
                    }
                    return Ok(SyncOutcome {
                        records_sent: batch.record_count,
                        last_seq: Some(batch.last_seq),
                        attempts: attempt,
                        server_uploaded: receipt.uploaded,
                    });
                }
                Ok(Ok(receipt)) => last_error = AgentError::UploadRejected(receipt.status).to_string(),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = AgentError::Transport(format!(
                    "upload timed out after {}ms",
                    options.timeout.as_millis()
                ))
                .to_string(),
            }

            if attempt < max_attempts {
                warn!(
                    attempt,
                    max_attempts,
                    error = %last_error,
                    retry_in_ms = options.retry_delay.as_millis() as u64,
                    "Upload attempt failed, retrying"
                );
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        error!(endpoint, attempts = max_attempts, error = %last_error, "Sync failed");
        Err(AgentError::SyncFailed {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Uploads records added since the cursor for `state_key` last moved.
    ///
    /// # Returns
    ///
    /// Number of records sent. Zero means nothing was new and no network
    /// call was made.
    ///
    /// # Errors
    ///
    /// Propagates upload failure; the cursor is left where it was.
    pub async fn sync_new_records(
        &self,
        source: &dyn RecordStore,
        endpoint: &str,
        state_key: &str,
    ) -> Result<usize> {
        let cursor = self.cursors.load(state_key).await;
        let max_seq = source.max_seq().await?;

        if max_seq <= cursor.last_synced_seq {
            debug!(state_key, cursor = cursor.last_synced_seq, "No new records");
            return Ok(0);
        }

        let options = self
            .options
            .clone()
            .with_row_range(cursor.last_synced_seq + 1..=max_seq);
        let outcome = self.sync_database_to_server(source, endpoint, &options).await?;

        if let Some(last_seq) = outcome.last_seq {
            self.cursors.advance(state_key, last_seq).await?;
        }
        Ok(outcome.records_sent)
    }
}
