//! Store-backed registry of running workers.
//!
//! Every worker is a member of the `workers` set. Its start time lives under
//! `worker:<id>:started` and the job it is busy with, if any, under
//! `worker:<id>`.

use crate::client::Resque;
use crate::error::JobResult;
use crate::handler::JobHandler;
use crate::payload::Payload;
use crate::stat::Stat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What a worker is busy with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingOn {
    /// Queue the job came from.
    pub queue: String,
    /// When the worker picked it up, RFC 3339.
    pub run_at: String,
    /// The payload being executed.
    pub payload: Payload,
}

/// Registry access for one client.
#[derive(Clone)]
pub struct WorkerRegistry {
    client: Resque,
}

impl WorkerRegistry {
    /// Creates a registry accessor.
    pub fn new(client: &Resque) -> Self {
        Self { client: client.clone() }
    }

    /// Registers a worker and records its start time.
    pub async fn register(&self, worker_id: &str) -> JobResult<()> {
        let keys = self.client.keys();
        self.client.store().set_add(&keys.workers(), worker_id).await?;
        self.client
            .store()
            .set(&keys.worker_started(worker_id), &Utc::now().to_rfc3339(), None)
            .await?;

        info!(worker_id = %worker_id, "Worker registered");
        Ok(())
    }

    /// Removes a worker with its start time, working-on marker and
    /// per-worker counters.
    pub async fn unregister(&self, worker_id: &str) -> JobResult<()> {
        let store = self.client.store();
        let keys = self.client.keys();
        store.set_remove(&keys.workers(), worker_id).await?;
        store.delete(&keys.worker(worker_id)).await?;
        store.delete(&keys.worker_started(worker_id)).await?;

        let stat = Stat::new(&self.client);
        stat.clear(&format!("processed:{worker_id}")).await?;
        stat.clear(&format!("failed:{worker_id}")).await?;

        info!(worker_id = %worker_id, "Worker unregistered");
        Ok(())
    }

    /// Whether `worker_id` is registered.
    pub async fn exists(&self, worker_id: &str) -> JobResult<bool> {
        self.client
            .store()
            .set_contains(&self.client.keys().workers(), worker_id)
            .await
    }

    /// Ids of all registered workers, sorted.
    pub async fn all(&self) -> JobResult<Vec<String>> {
        let mut workers = self.client.store().set_members(&self.client.keys().workers()).await?;
        workers.sort();
        Ok(workers)
    }

    /// Marks `worker_id` as busy with `handler`.
    pub async fn set_working_on(&self, worker_id: &str, handler: &JobHandler) -> JobResult<()> {
        let marker = WorkingOn {
            queue: handler.queue().to_string(),
            run_at: Utc::now().to_rfc3339(),
            payload: handler.payload().clone(),
        };
        self.client
            .store()
            .set(&self.client.keys().worker(worker_id), &serde_json::to_string(&marker)?, None)
            .await?;

        debug!(worker_id = %worker_id, job_id = %handler.id(), "Worker busy");
        Ok(())
    }

    /// The job `worker_id` is busy with, if any.
    pub async fn working_on(&self, worker_id: &str) -> JobResult<Option<WorkingOn>> {
        let raw = self.client.store().get(&self.client.keys().worker(worker_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Clears the working-on marker.
    pub async fn clear_working_on(&self, worker_id: &str) -> JobResult<()> {
        self.client.store().delete(&self.client.keys().worker(worker_id)).await?;
        Ok(())
    }

    /// When `worker_id` registered.
    pub async fn started_at(&self, worker_id: &str) -> JobResult<Option<DateTime<Utc>>> {
        let raw = self
            .client
            .store()
            .get(&self.client.keys().worker_started(worker_id))
            .await?;
        Ok(raw
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc)))
    }
}
