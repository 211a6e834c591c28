//! Resque Jobs - Redis-backed background job processing
//!
//! Producers push JSON payloads onto named queues; workers reserve them in
//! priority order and run each one in an isolated, supervised task:
//! - Class-name based job factory ([`JobRegistry`])
//! - Optional per-job status tracking with expiry
//! - Failure records and processed/failed counters
//! - Lifecycle events with veto points before enqueue and before perform
//! - Delayed jobs promoted by a [`Scheduler`]
//! - Pause, resume, graceful and immediate shutdown through [`WorkerControl`]
//!
//! # Architecture
//!
//! ```text
//!  Producer ──enqueue──▶ queue:<name> ◀──reserve── Worker ──spawn──▶ isolated unit
//!     │                      ▲                       │                   │
//!     │ enqueue_at           │ promote_due           │ registry          │ status, failure,
//!     ▼                      │                       ▼                   ▼ stats
//!  delayed:<ts> ── Scheduler ┘                    workers            job:<id>:status
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use resque_jobs::prelude::*;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Job for SendEmail {
//!     async fn perform(&mut self, ctx: &JobContext) -> JobResult<()> {
//!         tracing::info!(job_id = %ctx.id, to = %self.to, "Sending email");
//!         Ok(())
//!     }
//! }
//!
//! impl NamedJob for SendEmail {
//!     const NAME: &'static str = "Send_Email";
//! }
//!
//! let registry = JobRegistry::new();
//! registry.register_job::<SendEmail>();
//!
//! let client = Resque::from_config(&config).await?.with_factory(registry);
//! client.enqueue("emails", "Send_Email", json!({"to": "user@example.com"}), true, "").await?;
//!
//! let mut worker = Worker::new(client, vec!["emails".to_string()]);
//! worker.work(Duration::from_secs(5), true).await?;
//! ```

pub mod client;
pub mod error;
pub mod event;
pub mod failure;
pub mod handler;
pub mod job;
pub mod metrics;
pub mod payload;
pub mod scheduler;
pub mod stat;
pub mod status;
pub mod store;
pub mod worker;
pub mod worker_registry;

pub use client::{DequeueFilter, Resque};
pub use error::{JobError, JobResult};
pub use event::{Event, EventBus, EventKind, Listener, ListenerId};
pub use failure::{FailureBackend, FailureHandler, FailureRecord, RedisFailureBackend};
pub use handler::JobHandler;
pub use job::{Job, JobConstructor, JobContext, JobFactory, JobRegistry, NamedJob};
pub use metrics::{register_metrics, JobMetrics, SchedulerMetrics, WorkerMetrics};
pub use payload::{normalize_args, JobArgs, Payload};
pub use resque_core::JobId;
pub use scheduler::Scheduler;
pub use stat::Stat;
pub use status::{JobStatus, StatusCode, StatusRecord};
pub use store::{create_pool, KeySpace, MemoryStore, Promotion, RedisStore, Store};
pub use worker::{Isolation, Worker, WorkerControl, WorkerHandle, WorkerState, ALL_QUEUES};
pub use worker_registry::{WorkerRegistry, WorkingOn};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::event::{Event, EventKind};
    pub use crate::job::{Job, JobFactory, JobRegistry, NamedJob};
    pub use crate::store::Store;
    pub use crate::worker::{Worker, WorkerControl};
    pub use crate::{JobContext, JobError, JobId, JobResult, Resque};
}
