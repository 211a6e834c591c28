//! Job trait and the factory that builds job instances by class name.

use crate::error::{JobError, JobResult};
use crate::payload::JobArgs;
use async_trait::async_trait;
use parking_lot::RwLock;
use resque_core::JobId;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Job execution context.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub id: JobId,

    /// Class identifier the job was enqueued under.
    pub class: String,

    /// Queue the job was reserved from.
    pub queue: String,

    /// Argument mapping.
    pub args: JobArgs,

    /// Worker ID processing this job, if any.
    pub worker: Option<String>,
}

impl JobContext {
    /// Looks up one argument.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }
}

/// Trait for defining jobs.
///
/// Only [`Job::perform`] is required. `set_up` runs before it and
/// `tear_down` after it succeeds; an error from any of the three fails
/// the job.
///
/// # Example
///
/// ```rust,ignore
/// use resque_jobs::{Job, JobContext, JobResult, NamedJob};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for SendEmail {
///     async fn perform(&mut self, ctx: &JobContext) -> JobResult<()> {
///         tracing::info!(job_id = %ctx.id, to = %self.to, "Sending email");
///         Ok(())
///     }
/// }
///
/// impl NamedJob for SendEmail {
///     const NAME: &'static str = "Send_Email";
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// Called before `perform`.
    async fn set_up(&mut self, _ctx: &JobContext) -> JobResult<()> {
        Ok(())
    }

    /// Execute the job.
    async fn perform(&mut self, ctx: &JobContext) -> JobResult<()>;

    /// Called after `perform` returned successfully.
    async fn tear_down(&mut self, _ctx: &JobContext) -> JobResult<()> {
        Ok(())
    }
}

/// A job type that is built by deserializing its argument mapping.
pub trait NamedJob: Job + DeserializeOwned + 'static {
    /// Class identifier the job is registered under.
    const NAME: &'static str;
}

/// Builds job instances from a class identifier.
pub trait JobFactory: Send + Sync {
    /// Creates the job for `ctx.class`.
    ///
    /// Returns [`JobError::ClassNotFound`] if the class is unknown.
    fn create(&self, ctx: &JobContext) -> JobResult<Box<dyn Job>>;
}

/// Constructor stored in a [`JobRegistry`].
pub type JobConstructor = Arc<dyn Fn(&JobContext) -> JobResult<Box<dyn Job>> + Send + Sync>;

/// Name to constructor map, filled at startup.
#[derive(Clone, Default)]
pub struct JobRegistry {
    constructors: Arc<RwLock<HashMap<String, JobConstructor>>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `name`, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, constructor: F) -> &Self
    where
        F: Fn(&JobContext) -> JobResult<Box<dyn Job>> + Send + Sync + 'static,
    {
        let name = name.into();
        info!(job_class = %name, "Registered job class");
        self.constructors.write().insert(name, Arc::new(constructor));
        self
    }

    /// Registers a job type that is deserialized from its arguments.
    pub fn register_job<J: NamedJob>(&self) -> &Self {
        self.register(J::NAME, |ctx: &JobContext| {
            let job: J = serde_json::from_value(Value::Object(ctx.args.clone()))
                .map_err(|e| JobError::ArgumentType(format!("{}: {}", ctx.class, e)))?;
            Ok(Box::new(job) as Box<dyn Job>)
        })
    }

    /// Checks whether a class is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Registered class names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl JobFactory for JobRegistry {
    fn create(&self, ctx: &JobContext) -> JobResult<Box<dyn Job>> {
        let constructor = self
            .constructors
            .read()
            .get(&ctx.class)
            .cloned()
            .ok_or_else(|| JobError::ClassNotFound(ctx.class.clone()))?;
        constructor(ctx)
    }
}
