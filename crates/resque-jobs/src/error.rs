//! Job error types.

use resque_core::CoreError;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Arguments given at enqueue time are not a mapping. Nothing was written.
    #[error("Job arguments must be a mapping: {0}")]
    ArgumentType(String),

    /// The job factory does not know the class.
    #[error("Could not find job class {0}")]
    ClassNotFound(String),

    /// A before-perform listener asked to skip the job.
    #[error("Job was vetoed by a before-perform listener")]
    DoNotPerform,

    /// A before-enqueue listener asked not to create the job.
    #[error("Job creation was cancelled by a before-enqueue listener")]
    EnqueueCancelled,

    /// Job execution failed.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Job code panicked inside its isolated unit.
    #[error("Job panicked: {0}")]
    Panicked(String),

    /// The isolated unit was killed by its supervising worker.
    #[error("Job was aborted by the worker")]
    Aborted,

    /// Status update that would move a job back to waiting.
    #[error("Invalid status transition: {0}")]
    InvalidStatus(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Store error not coming from the Redis client.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if the backing store could not serve the request.
    ///
    /// Workers back off and retry on these instead of stopping.
    pub fn is_store_fault(&self) -> bool {
        matches!(self, JobError::Redis(_) | JobError::Pool(_) | JobError::Store(_))
    }

    /// Returns true for faults raised by job code or its isolation unit.
    pub fn is_job_fault(&self) -> bool {
        matches!(
            self,
            JobError::ExecutionFailed(_) | JobError::Panicked(_) | JobError::Aborted | JobError::ClassNotFound(_)
        )
    }

    /// Short name of the error kind, stored in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::ArgumentType(_) => "ArgumentType",
            JobError::ClassNotFound(_) => "ClassNotFound",
            JobError::DoNotPerform => "DoNotPerform",
            JobError::EnqueueCancelled => "EnqueueCancelled",
            JobError::ExecutionFailed(_) => "ExecutionFailed",
            JobError::Panicked(_) => "Panicked",
            JobError::Aborted => "Aborted",
            JobError::InvalidStatus(_) => "InvalidStatus",
            JobError::Serialization(_) => "Serialization",
            JobError::Redis(_) => "Redis",
            JobError::Pool(_) => "Pool",
            JobError::Store(_) => "Store",
            JobError::Configuration(_) => "Configuration",
            JobError::Worker(_) => "Worker",
            JobError::Internal(_) => "Internal",
        }
    }

    /// Creates an execution failure from any displayable error.
    pub fn execution(err: impl std::fmt::Display) -> Self {
        JobError::ExecutionFailed(err.to_string())
    }
}

impl From<CoreError> for JobError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Configuration(msg) => JobError::Configuration(msg),
            CoreError::Store(msg) => JobError::Store(msg),
            CoreError::Serialization(e) => JobError::Serialization(e),
            other => JobError::Internal(other.to_string()),
        }
    }
}
