//! Execution lifecycle of one reserved payload.

use crate::client::Resque;
use crate::error::{JobError, JobResult};
use crate::event::Event;
use crate::failure::FailureHandler;
use crate::job::{Job, JobContext};
use crate::metrics::JobMetrics;
use crate::payload::{normalize_args, now_seconds, JobArgs, Payload};
use crate::stat::Stat;
use crate::status::{JobStatus, StatusCode};
use chrono::{DateTime, Utc};
use resque_core::JobId;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn};

/// One payload together with the state of its execution.
pub struct JobHandler {
    client: Resque,
    queue: String,
    payload: Payload,
    worker: Option<String>,
    pop_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    instance: Option<Box<dyn Job>>,
}

impl JobHandler {
    /// Wraps a payload reserved from `queue`.
    pub fn new(client: Resque, queue: impl Into<String>, payload: Payload) -> Self {
        Self {
            client,
            queue: queue.into(),
            payload,
            worker: None,
            pop_time: None,
            start_time: None,
            end_time: None,
            instance: None,
        }
    }

    /// Pushes a new job onto `queue` and returns its id.
    ///
    /// `args` must be a mapping (or null); anything else fails with
    /// [`JobError::ArgumentType`] before the store is touched. A fresh id is
    /// generated unless one is given. With `monitor` a waiting status record
    /// is created as well.
    pub async fn create(
        client: &Resque,
        queue: &str,
        class: &str,
        args: Value,
        monitor: bool,
        id: Option<JobId>,
        prefix: &str,
    ) -> JobResult<JobId> {
        let args = normalize_args(args)?;
        Self::create_with_args(client, queue, class, args, monitor, id, prefix).await
    }

    pub(crate) async fn create_with_args(
        client: &Resque,
        queue: &str,
        class: &str,
        args: JobArgs,
        monitor: bool,
        id: Option<JobId>,
        prefix: &str,
    ) -> JobResult<JobId> {
        let id = id.unwrap_or_else(|| client.generate_job_id());
        let payload = Payload::new(queue, class, args, id.clone())
            .with_prefix(prefix)
            .with_monitor(monitor);

        // Status first, so a fast worker never sees its running state
        // overwritten by waiting.
        if monitor {
            JobStatus::new(client, id.clone(), prefix).create().await?;
        }

        client.push(queue, &payload).await?;

        JobMetrics::job_enqueued(queue, class);
        debug!(job_id = %id, queue = %queue, class = %class, "Enqueued job");

        Ok(id)
    }

    /// Pops the next payload from `queue`.
    pub async fn reserve(client: &Resque, queue: &str) -> JobResult<Option<JobHandler>> {
        Ok(client
            .pop(queue)
            .await?
            .map(|payload| Self::new(client.clone(), queue, payload).popped()))
    }

    /// Pops from the first non-empty queue among `queues`, waiting up to
    /// `timeout`. Earlier queues win when several hold work.
    pub async fn reserve_blocking(client: &Resque, queues: &[String], timeout: Duration) -> JobResult<Option<JobHandler>> {
        Ok(client
            .blpop(queues, timeout)
            .await?
            .map(|(queue, payload)| Self::new(client.clone(), queue, payload).popped()))
    }

    fn popped(mut self) -> Self {
        self.pop_time = Some(Utc::now());
        JobMetrics::job_reserved(&self.queue, &self.payload.class);

        let waited = now_seconds() - self.payload.queue_time;
        if waited.is_finite() && waited > 0.0 {
            JobMetrics::job_wait_time(&self.queue, &self.payload.class, Duration::from_secs_f64(waited));
        }
        self
    }

    /// Queue the payload came from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Job id.
    pub fn id(&self) -> &JobId {
        &self.payload.id
    }

    /// Job class.
    pub fn class(&self) -> &str {
        &self.payload.class
    }

    /// Client the handler runs against.
    pub fn client(&self) -> &Resque {
        &self.client
    }

    /// Worker running the job.
    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    /// Assigns the owning worker.
    pub fn set_worker(&mut self, worker: impl Into<String>) {
        self.worker = Some(worker.into());
    }

    /// Moves the handler onto another client, used when crossing into an
    /// isolated unit with its own connection.
    pub fn with_client(mut self, client: Resque) -> Self {
        self.client = client;
        self
    }

    /// When the payload was popped.
    pub fn pop_time(&self) -> Option<DateTime<Utc>> {
        self.pop_time
    }

    /// When `perform` started the job.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// When the job finished or failed.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// The argument mapping.
    pub fn arguments(&self) -> &JobArgs {
        &self.payload.args
    }

    /// Context handed to the job instance.
    pub fn context(&self) -> JobContext {
        JobContext {
            id: self.payload.id.clone(),
            class: self.payload.class.clone(),
            queue: self.queue.clone(),
            args: self.payload.args.clone(),
            worker: self.worker.clone(),
        }
    }

    /// Builds the job instance through the factory on first use.
    pub fn instance(&mut self) -> JobResult<&mut dyn Job> {
        if self.instance.is_none() {
            let ctx = self.context();
            self.instance = Some(self.client.factory().create(&ctx)?);
        }
        match self.instance.as_deref_mut() {
            Some(job) => Ok(job),
            None => Err(JobError::Internal("job instance missing after creation".to_string())),
        }
    }

    /// Runs the job.
    ///
    /// Returns `Ok(false)` when a before-perform listener vetoed the job;
    /// nothing else happens in that case. Any other error is returned as is
    /// and the caller is expected to call [`JobHandler::fail`].
    pub async fn perform(&mut self) -> JobResult<bool> {
        self.instance()?;

        match self.client.events().trigger(&Event::BeforePerform(&*self)) {
            Ok(()) => {}
            Err(JobError::DoNotPerform) => {
                debug!(job_id = %self.payload.id, "Job skipped by before-perform listener");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.start_time = Some(Utc::now());
        let ctx = self.context();
        let job = self.instance()?;
        job.set_up(&ctx).await?;
        job.perform(&ctx).await?;
        job.tear_down(&ctx).await?;
        self.end_time = Some(Utc::now());

        self.client.events().trigger(&Event::AfterPerform(&*self))?;

        if let Some(duration) = self.run_duration() {
            JobMetrics::job_completed(&self.queue, &self.payload.class, duration);
        }
        Ok(true)
    }

    /// Records a failure.
    ///
    /// Fires `OnFailure`, marks the status failed, hands the fault to the
    /// failure backend and bumps the `failed` and `failed:<worker>` counters.
    /// Listener errors are logged and do not stop the bookkeeping. Every
    /// store step is attempted even if an earlier one fails; the first store
    /// error is returned.
    pub async fn fail(&mut self, fault: &JobError) -> JobResult<()> {
        self.end_time = Some(Utc::now());

        if let Err(e) = self.client.events().trigger(&Event::OnFailure { fault, handler: &*self }) {
            warn!(job_id = %self.payload.id, error = %e, "On-failure listener returned an error");
        }

        let worker = self.worker.clone().unwrap_or_default();
        let stat = Stat::new(&self.client);
        let mut steps = vec![
            (
                "status",
                self.update_status(StatusCode::Failed, None).await,
            ),
            (
                "failure record",
                FailureHandler::create(&self.client, &self.payload, fault, &worker, &self.queue).await,
            ),
            ("failed counter", stat.incr("failed").await.map(drop)),
        ];
        if !worker.is_empty() {
            steps.push((
                "worker failed counter",
                stat.incr(&format!("failed:{worker}")).await.map(drop),
            ));
        }

        let mut first_error = None;
        for (step, result) in steps {
            if let Err(e) = result {
                error!(job_id = %self.payload.id, step = step, error = %e, "Failed to record job failure");
                first_error.get_or_insert(e);
            }
        }

        JobMetrics::job_failed(
            &self.queue,
            &self.payload.class,
            fault.kind(),
            self.run_duration().unwrap_or_default(),
        );
        warn!(job_id = %self.payload.id, class = %self.payload.class, error = %fault, "Job failed");
        first_error.map_or(Ok(()), Err)
    }

    /// Enqueues a copy of this job under a fresh id.
    ///
    /// Status tracking is carried over if the original is tracked.
    pub async fn recreate(&self) -> JobResult<JobId> {
        let monitor = self.status_tracker().is_tracking().await?;
        Self::create_with_args(
            &self.client,
            &self.queue,
            &self.payload.class,
            self.payload.args.clone(),
            monitor,
            None,
            &self.payload.prefix,
        )
        .await
    }

    /// Updates the job status if it is tracked.
    pub async fn update_status(&self, status: StatusCode, result: Option<Value>) -> JobResult<()> {
        if self.payload.id.is_empty() {
            return Ok(());
        }
        self.status_tracker().update(status, result).await?;
        Ok(())
    }

    /// Current status, `None` if untracked.
    pub async fn status(&self) -> JobResult<Option<StatusCode>> {
        self.status_tracker().get().await
    }

    fn status_tracker(&self) -> JobStatus {
        JobStatus::new(&self.client, self.payload.id.clone(), self.payload.prefix.clone())
    }

    fn run_duration(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time?;
        (end - start).to_std().ok()
    }
}

impl fmt::Display for JobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = serde_json::to_string(&self.payload.args).unwrap_or_default();
        write!(
            f,
            "(Job{{{}}} | ID: {} | {} | {})",
            self.queue, self.payload.id, self.payload.class, args
        )
    }
}

impl fmt::Debug for JobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandler")
            .field("queue", &self.queue)
            .field("payload", &self.payload)
            .field("worker", &self.worker)
            .field("pop_time", &self.pop_time)
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .finish_non_exhaustive()
    }
}
