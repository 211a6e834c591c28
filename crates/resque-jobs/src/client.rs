//! Client facade over one store namespace.

use crate::error::{JobError, JobResult};
use crate::event::{Event, EventBus};
use crate::failure::{FailureBackend, RedisFailureBackend};
use crate::handler::JobHandler;
use crate::job::{JobFactory, JobRegistry};
use crate::payload::{normalize_args, JobArgs, Payload};
use crate::scheduler::Scheduler;
use crate::stat::Stat;
use crate::status::JobStatus;
use crate::store::{KeySpace, RedisStore, Store};
use chrono::{DateTime, Utc};
use resque_config::JobsConfig;
use resque_core::JobId;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(86400);

/// Selects queue entries for [`Resque::dequeue`].
#[derive(Debug, Clone, PartialEq)]
pub enum DequeueFilter {
    /// Every job of a class.
    Class(String),
    /// The job of a class with this exact id.
    ClassId {
        /// Job class.
        class: String,
        /// Job id.
        id: JobId,
    },
    /// Jobs of a class whose arguments equal `args`, ignoring key order.
    ClassArgs {
        /// Job class.
        class: String,
        /// Argument mapping.
        args: JobArgs,
    },
}

impl DequeueFilter {
    /// Matches a job by class.
    pub fn class(class: impl Into<String>) -> Self {
        Self::Class(class.into())
    }

    /// Matches a job by class and id.
    pub fn class_id(class: impl Into<String>, id: impl Into<JobId>) -> Self {
        Self::ClassId {
            class: class.into(),
            id: id.into(),
        }
    }

    /// Matches a job by class and arguments. Non-mapping arguments are
    /// rejected.
    pub fn class_args(class: impl Into<String>, args: Value) -> JobResult<Self> {
        Ok(Self::ClassArgs {
            class: class.into(),
            args: normalize_args(args)?,
        })
    }

    fn matches(&self, payload: &Payload) -> bool {
        match self {
            Self::Class(class) => payload.class == *class,
            Self::ClassId { class, id } => payload.class == *class && payload.id == *id,
            Self::ClassArgs { class, args } => payload.class == *class && payload.args == *args,
        }
    }
}

/// Entry point for producers, workers and the scheduler.
///
/// Cheap to clone; clones share the store handle, listeners and factory.
#[derive(Clone)]
pub struct Resque {
    store: Arc<dyn Store>,
    keys: KeySpace,
    factory: Arc<dyn JobFactory>,
    events: EventBus,
    failure: Arc<dyn FailureBackend>,
    status_ttl: Duration,
}

impl Resque {
    /// Creates a client over `store` with keys under `prefix`.
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            keys: KeySpace::new(prefix),
            factory: Arc::new(JobRegistry::new()),
            events: EventBus::new(),
            failure: Arc::new(RedisFailureBackend),
            status_ttl: DEFAULT_STATUS_TTL,
        }
    }

    /// Connects to Redis as configured.
    pub async fn from_config(config: &JobsConfig) -> JobResult<Self> {
        let store = RedisStore::connect(&config.redis).await?;
        info!(prefix = %config.redis.key_prefix, "Resque client connected");
        Ok(Self::new(Arc::new(store), config.redis.key_prefix.clone()).with_status_ttl(config.status.ttl()))
    }

    /// Uses `factory` to build job instances.
    #[must_use]
    pub fn with_factory(mut self, factory: impl JobFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Uses `events` for lifecycle hooks.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Uses `backend` to persist failures.
    #[must_use]
    pub fn with_failure_backend(mut self, backend: impl FailureBackend + 'static) -> Self {
        self.failure = Arc::new(backend);
        self
    }

    /// Expiry of status records in a terminal state.
    #[must_use]
    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    /// Store handle.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Key namespace.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Job factory.
    pub fn factory(&self) -> &Arc<dyn JobFactory> {
        &self.factory
    }

    /// Lifecycle hooks.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Failure backend.
    pub fn failure_backend(&self) -> &Arc<dyn FailureBackend> {
        &self.failure
    }

    /// Expiry of terminal status records.
    pub fn status_ttl(&self) -> Duration {
        self.status_ttl
    }

    /// Named counters.
    pub fn stat(&self) -> Stat {
        Stat::new(self)
    }

    /// Status tracker for a job.
    pub fn status(&self, id: JobId, prefix: &str) -> JobStatus {
        JobStatus::new(self, id, prefix)
    }

    /// Delayed-schedule access.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.clone())
    }

    /// Same client over a fresh store connection.
    pub async fn reconnect(&self) -> JobResult<Self> {
        let store = self.store.reconnect().await?;
        Ok(Self {
            store,
            ..self.clone()
        })
    }

    /// New random job id.
    pub fn generate_job_id(&self) -> JobId {
        JobId::new()
    }

    /// Enqueues a job.
    ///
    /// Returns `None` if a before-enqueue listener cancelled it with
    /// [`JobError::EnqueueCancelled`].
    pub async fn enqueue(
        &self,
        queue: &str,
        class: &str,
        args: Value,
        track_status: bool,
        prefix: &str,
    ) -> JobResult<Option<JobId>> {
        let args = normalize_args(args)?;
        let id = self.generate_job_id();

        let before = Event::BeforeEnqueue {
            queue,
            class,
            args: &args,
            id: &id,
        };
        match self.events.trigger(&before) {
            Ok(()) => {}
            Err(JobError::EnqueueCancelled) => {
                debug!(queue = %queue, class = %class, "Enqueue cancelled by listener");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let id = JobHandler::create_with_args(self, queue, class, args.clone(), track_status, Some(id), prefix).await?;

        self.events.trigger(&Event::AfterEnqueue {
            queue,
            class,
            args: &args,
            id: &id,
        })?;

        Ok(Some(id))
    }

    /// Pushes a payload onto a queue and records the queue name.
    pub async fn push(&self, queue: &str, payload: &Payload) -> JobResult<()> {
        let raw = payload.to_json()?;
        self.store.set_add(&self.keys.queues(), queue).await?;
        self.store.push(&self.keys.queue(queue), &raw).await?;
        Ok(())
    }

    /// Pops the next payload of a queue.
    pub async fn pop(&self, queue: &str) -> JobResult<Option<Payload>> {
        match self.store.pop(&self.keys.queue(queue)).await? {
            Some(raw) => Ok(Some(Payload::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    /// Pops from the first non-empty queue among `queues`, waiting up to
    /// `timeout`. Returns the queue served and the payload.
    pub async fn blpop(&self, queues: &[String], timeout: Duration) -> JobResult<Option<(String, Payload)>> {
        let keys: Vec<String> = queues.iter().map(|q| self.keys.queue(q)).collect();
        let Some((key, raw)) = self.store.blocking_pop(&keys, timeout).await? else {
            return Ok(None);
        };

        let queue = self
            .keys
            .strip(&key)
            .and_then(|k| k.strip_prefix("queue:"))
            .map(str::to_string)
            .ok_or_else(|| JobError::Store(format!("unexpected key '{key}' from blocking pop")))?;
        Ok(Some((queue, Payload::from_json(&raw)?)))
    }

    /// Number of pending payloads in a queue.
    pub async fn size(&self, queue: &str) -> JobResult<u64> {
        self.store.list_len(&self.keys.queue(queue)).await
    }

    /// Known queue names, sorted.
    pub async fn queues(&self) -> JobResult<Vec<String>> {
        let mut queues = self.store.set_members(&self.keys.queues()).await?;
        queues.sort();
        Ok(queues)
    }

    /// Payloads of a queue between `start` and `stop`, inclusive.
    pub async fn items(&self, queue: &str, start: isize, stop: isize) -> JobResult<Vec<Payload>> {
        self.store
            .list_range(&self.keys.queue(queue), start, stop)
            .await?
            .iter()
            .map(|raw| Payload::from_json(raw))
            .collect()
    }

    /// Removes the entries of `queue` matched by any filter and returns how
    /// many were removed. Survivors keep their order. With no filters the
    /// whole queue content is removed.
    pub async fn dequeue(&self, queue: &str, filters: &[DequeueFilter]) -> JobResult<u64> {
        if filters.is_empty() {
            return self.remove_list(queue).await;
        }

        let key = self.keys.queue(queue);
        let mut removed = 0;
        for raw in self.store.list_range(&key, 0, -1).await? {
            let payload = match Payload::from_json(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Skipping undecodable payload");
                    continue;
                }
            };
            if filters.iter().any(|f| f.matches(&payload)) {
                removed += self.store.list_remove(&key, &raw).await?;
            }
        }

        debug!(queue = %queue, removed = removed, "Dequeued jobs");
        Ok(removed)
    }

    /// Deletes a queue and forgets its name. Returns the number of payloads
    /// it held.
    pub async fn remove_queue(&self, queue: &str) -> JobResult<u64> {
        let removed = self.remove_list(queue).await?;
        self.store.set_remove(&self.keys.queues(), queue).await?;
        Ok(removed)
    }

    async fn remove_list(&self, queue: &str) -> JobResult<u64> {
        let count = self.size(queue).await?;
        let deleted = self.store.delete(&self.keys.queue(queue)).await?;
        Ok(if deleted { count } else { 0 })
    }

    /// Reserves the next job of a queue.
    pub async fn reserve(&self, queue: &str) -> JobResult<Option<JobHandler>> {
        JobHandler::reserve(self, queue).await
    }

    /// Schedules a job to run at `at`.
    pub async fn enqueue_at(&self, at: DateTime<Utc>, queue: &str, class: &str, args: Value) -> JobResult<JobId> {
        self.scheduler().enqueue_at(at, queue, class, args).await
    }

    /// Schedules a job to run after `delay`.
    pub async fn enqueue_in(&self, delay: Duration, queue: &str, class: &str, args: Value) -> JobResult<JobId> {
        self.scheduler().enqueue_in(delay, queue, class, args).await
    }

    /// Total number of delayed payloads.
    pub async fn delayed_queue_schedule_size(&self) -> JobResult<u64> {
        self.scheduler().delayed_queue_schedule_size().await
    }

    /// Number of payloads delayed until `at`.
    pub async fn delayed_timestamp_size(&self, at: DateTime<Utc>) -> JobResult<u64> {
        self.scheduler().delayed_timestamp_size(at).await
    }

    /// Removes matching delayed payloads from every timestamp.
    pub async fn remove_delayed(&self, queue: &str, class: &str, args: Value) -> JobResult<u64> {
        self.scheduler().remove_delayed(queue, class, args).await
    }

    /// Removes matching delayed payloads scheduled at `at`.
    pub async fn remove_delayed_job_from_timestamp(
        &self,
        at: DateTime<Utc>,
        queue: &str,
        class: &str,
        args: Value,
    ) -> JobResult<u64> {
        self.scheduler()
            .remove_delayed_job_from_timestamp(at, queue, class, args)
            .await
    }
}
