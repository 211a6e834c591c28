//! Per-job status records.
//!
//! A tracked job owns one JSON record at `job:<prefix><id>:status`. The record
//! is written whole on every change, so no update depends on a prior read.

use crate::client::Resque;
use crate::error::{JobError, JobResult};
use chrono::Utc;
use resque_core::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Lifecycle state of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum StatusCode {
    /// Enqueued, not yet reserved.
    Waiting = 1,
    /// Reserved and executing.
    Running = 2,
    /// Execution failed.
    Failed = 3,
    /// Execution completed.
    Complete = 4,
}

impl StatusCode {
    /// Returns true for states a job never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusCode::Failed | StatusCode::Complete)
    }
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StatusCode::Waiting),
            2 => Ok(StatusCode::Running),
            3 => Ok(StatusCode::Failed),
            4 => Ok(StatusCode::Complete),
            other => Err(format!("unknown job status code {other}")),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Waiting => "waiting",
            StatusCode::Running => "running",
            StatusCode::Failed => "failed",
            StatusCode::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Stored status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Current state.
    pub status: StatusCode,

    /// Unix time of the last write.
    pub updated: i64,

    /// Unix time the job entered its current waiting or running phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<i64>,

    /// Value reported by the job.
    #[serde(default)]
    pub result: Option<Value>,
}

/// Status tracker for one job.
#[derive(Clone)]
pub struct JobStatus {
    client: Resque,
    id: JobId,
    prefix: String,
}

impl JobStatus {
    /// Creates a tracker for job `id` in status namespace `prefix`.
    pub fn new(client: &Resque, id: JobId, prefix: impl Into<String>) -> Self {
        Self {
            client: client.clone(),
            id,
            prefix: prefix.into(),
        }
    }

    /// Job id.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    fn key(&self) -> String {
        self.client.keys().status(&self.prefix, self.id.as_str())
    }

    /// Starts tracking the job in the waiting state.
    pub async fn create(&self) -> JobResult<()> {
        let now = Utc::now().timestamp();
        let record = StatusRecord {
            status: StatusCode::Waiting,
            updated: now,
            started: Some(now),
            result: None,
        };
        self.client
            .store()
            .set(&self.key(), &serde_json::to_string(&record)?, None)
            .await?;
        debug!(job_id = %self.id, "Status tracking started");
        Ok(())
    }

    /// Moves a tracked job to `status`.
    ///
    /// Does nothing for untracked jobs and returns `false`. Terminal states
    /// get the configured expiry.
    pub async fn update(&self, status: StatusCode, result: Option<Value>) -> JobResult<bool> {
        if status == StatusCode::Waiting {
            return Err(JobError::InvalidStatus(format!(
                "job {} cannot move back to waiting",
                self.id
            )));
        }

        let now = Utc::now().timestamp();
        let record = StatusRecord {
            status,
            updated: now,
            started: (status == StatusCode::Running).then_some(now),
            result,
        };
        let ttl = status.is_terminal().then(|| self.client.status_ttl());

        let updated = self
            .client
            .store()
            .replace(&self.key(), &serde_json::to_string(&record)?, ttl)
            .await?;
        if updated {
            debug!(job_id = %self.id, status = %status, "Status updated");
        }
        Ok(updated)
    }

    /// Current state, `None` if untracked or expired.
    pub async fn get(&self) -> JobResult<Option<StatusCode>> {
        Ok(self.get_record().await?.map(|r| r.status))
    }

    /// Whole stored record.
    pub async fn get_record(&self) -> JobResult<Option<StatusRecord>> {
        match self.client.store().get(&self.key()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Checks whether a status record exists.
    pub async fn is_tracking(&self) -> JobResult<bool> {
        self.client.store().exists(&self.key()).await
    }

    /// Stops tracking the job.
    pub async fn stop(&self) -> JobResult<()> {
        self.client.store().delete(&self.key()).await?;
        Ok(())
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job:{}{}:status", self.prefix, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn client() -> Resque {
        Resque::new(Arc::new(MemoryStore::new()), "test")
    }

    #[test]
    fn test_code_wire_values() {
        assert_eq!(serde_json::to_string(&StatusCode::Complete).unwrap(), "4");
        assert_eq!(serde_json::from_str::<StatusCode>("2").unwrap(), StatusCode::Running);
        assert!(serde_json::from_str::<StatusCode>("9").is_err());
    }

    #[tokio::test]
    async fn test_untracked_job() {
        let status = JobStatus::new(&client(), JobId::from("x"), "");
        assert!(!status.is_tracking().await.unwrap());
        assert!(!status.update(StatusCode::Running, None).await.unwrap());
        assert_eq!(status.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let client = client();
        let status = JobStatus::new(&client, JobId::from("abc"), "");
        status.create().await.unwrap();
        assert_eq!(status.get().await.unwrap(), Some(StatusCode::Waiting));

        assert!(status.update(StatusCode::Running, None).await.unwrap());
        assert_eq!(status.get().await.unwrap(), Some(StatusCode::Running));
        let key = client.keys().status("", "abc");
        assert_eq!(client.store().ttl(&key).await.unwrap(), None);

        status.update(StatusCode::Complete, Some(json!({"ok": true}))).await.unwrap();
        let record = status.get_record().await.unwrap().unwrap();
        assert_eq!(record.status, StatusCode::Complete);
        assert_eq!(record.result, Some(json!({"ok": true})));

        let ttl = client.store().ttl(&key).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(86000));

        status.stop().await.unwrap();
        assert!(!status.is_tracking().await.unwrap());
    }

    #[tokio::test]
    async fn test_cannot_move_back_to_waiting() {
        let status = JobStatus::new(&client(), JobId::from("abc"), "");
        status.create().await.unwrap();
        status.update(StatusCode::Running, None).await.unwrap();
        assert!(matches!(
            status.update(StatusCode::Waiting, None).await,
            Err(JobError::InvalidStatus(_))
        ));
        assert_eq!(status.get().await.unwrap(), Some(StatusCode::Running));
    }

    #[tokio::test]
    async fn test_prefix_is_part_of_key() {
        let client = client();
        JobStatus::new(&client, JobId::from("abc"), "app_").create().await.unwrap();
        assert!(client.store().exists("test:job:app_abc:status").await.unwrap());
        assert!(!JobStatus::new(&client, JobId::from("abc"), "").is_tracking().await.unwrap());
    }
}
