//! Failure capture.
//!
//! Every failed job produces one [`FailureRecord`] handed to the client's
//! [`FailureBackend`]. The default backend appends JSON records to the
//! `failed` list.

use crate::client::Resque;
use crate::error::{JobError, JobResult};
use crate::payload::Payload;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Persisted description of one job execution fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Time of failure, RFC 3339.
    pub failed_at: String,

    /// Payload of the failed job.
    pub payload: Payload,

    /// Error kind.
    pub exception: String,

    /// Error message.
    pub error: String,

    /// Worker that ran the job.
    pub worker: String,

    /// Queue the job was reserved from.
    pub queue: String,
}

impl FailureRecord {
    /// Builds a record stamped with the current time.
    pub fn new(payload: &Payload, fault: &JobError, worker: &str, queue: &str) -> Self {
        Self {
            failed_at: Utc::now().to_rfc3339(),
            payload: payload.clone(),
            exception: fault.kind().to_string(),
            error: fault.to_string(),
            worker: worker.to_string(),
            queue: queue.to_string(),
        }
    }
}

/// Persistence of failure records.
#[async_trait]
pub trait FailureBackend: Send + Sync {
    /// Stores one record.
    async fn record(&self, client: &Resque, record: &FailureRecord) -> JobResult<()>;
}

/// Backend storing records in the `failed` list of the client's store.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisFailureBackend;

impl RedisFailureBackend {
    /// Number of stored records.
    pub async fn count(client: &Resque) -> JobResult<u64> {
        client.store().list_len(&client.keys().failed()).await
    }

    /// Records between `start` and `stop`, inclusive, oldest first.
    ///
    /// Entries that no longer decode are skipped.
    pub async fn all(client: &Resque, start: isize, stop: isize) -> JobResult<Vec<FailureRecord>> {
        let raw = client.store().list_range(&client.keys().failed(), start, stop).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable failure record");
                    None
                }
            })
            .collect())
    }

    /// Deletes all records. Returns how many there were.
    pub async fn clear(client: &Resque) -> JobResult<u64> {
        let count = Self::count(client).await?;
        client.store().delete(&client.keys().failed()).await?;
        Ok(count)
    }
}

#[async_trait]
impl FailureBackend for RedisFailureBackend {
    async fn record(&self, client: &Resque, record: &FailureRecord) -> JobResult<()> {
        let raw = serde_json::to_string(record)?;
        client.store().push(&client.keys().failed(), &raw).await?;
        Ok(())
    }
}

/// Entry point used by job handlers.
pub struct FailureHandler;

impl FailureHandler {
    /// Builds a record for `(payload, fault, worker, queue)` and hands it to
    /// the client's backend.
    pub async fn create(client: &Resque, payload: &Payload, fault: &JobError, worker: &str, queue: &str) -> JobResult<()> {
        let record = FailureRecord::new(payload, fault, worker, queue);
        client.failure_backend().record(client, &record).await
    }
}
