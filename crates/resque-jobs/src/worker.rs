//! Queue worker.
//!
//! A worker reserves payloads from its queues in priority order and runs each
//! one in an isolated unit: a spawned tokio task with its own store handle.
//! The worker supervises the unit and always observes a terminal outcome,
//! whether the job completed, failed, panicked or was aborted.
//!
//! Control messages arrive through a [`WorkerHandle`] or, when enabled, from
//! OS signals:
//!
//! | Signal      | Message                         |
//! |-------------|---------------------------------|
//! | `QUIT`      | [`WorkerControl::Shutdown`]     |
//! | `TERM`/`INT`| [`WorkerControl::ShutdownNow`]  |
//! | `USR1`      | [`WorkerControl::KillChild`]    |
//! | `USR2`      | [`WorkerControl::Pause`]        |
//! | `CONT`      | [`WorkerControl::Resume`]       |

use crate::client::Resque;
use crate::error::{JobError, JobResult};
use crate::event::Event;
use crate::handler::JobHandler;
use crate::metrics::WorkerMetrics;
use crate::stat::Stat;
use crate::status::StatusCode;
use crate::worker_registry::WorkerRegistry;
use futures::FutureExt;
use parking_lot::RwLock;
use resque_config::{IsolationMode, WorkerConfig};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Queue name that expands to every known queue.
pub const ALL_QUEUES: &str = "*";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, not yet registered.
    Starting,
    /// Waiting for work.
    Waiting,
    /// Supervising a job.
    Working,
    /// Not reserving new work.
    Paused,
    /// Finishing up before stopping.
    ShuttingDown,
    /// Unregistered, loop exited.
    Stopped,
}

/// Messages that steer a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerControl {
    /// Stop after the current job.
    Shutdown,
    /// Abort the current job, then stop.
    ShutdownNow,
    /// Stop reserving new work.
    Pause,
    /// Undo a pause.
    Resume,
    /// Abort the current job and keep going.
    KillChild,
}

/// How a job is run relative to the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// In a spawned task on a fresh store connection. Can be aborted.
    #[default]
    Task,
    /// In the worker loop itself. Panics are still caught, but the job
    /// cannot be aborted.
    Inline,
}

impl From<IsolationMode> for Isolation {
    fn from(mode: IsolationMode) -> Self {
        match mode {
            IsolationMode::Task => Isolation::Task,
            IsolationMode::Inline => Isolation::Inline,
        }
    }
}

/// Cloneable remote control for a [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    id: String,
    tx: mpsc::UnboundedSender<WorkerControl>,
    state: Arc<RwLock<WorkerState>>,
}

impl WorkerHandle {
    /// Id of the controlled worker.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state of the worker.
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Sends a control message. Returns false once the worker is gone.
    pub fn send(&self, control: WorkerControl) -> bool {
        self.tx.send(control).is_ok()
    }

    /// Graceful shutdown.
    pub fn shutdown(&self) -> bool {
        self.send(WorkerControl::Shutdown)
    }

    /// Immediate shutdown.
    pub fn shutdown_now(&self) -> bool {
        self.send(WorkerControl::ShutdownNow)
    }

    /// Pause reservation.
    pub fn pause(&self) -> bool {
        self.send(WorkerControl::Pause)
    }

    /// Resume reservation.
    pub fn resume(&self) -> bool {
        self.send(WorkerControl::Resume)
    }

    /// Abort the in-flight job.
    pub fn kill_child(&self) -> bool {
        self.send(WorkerControl::KillChild)
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// A queue worker.
pub struct Worker {
    client: Resque,
    id: String,
    queues: Vec<String>,
    registry: WorkerRegistry,
    isolation: Isolation,
    interval: Duration,
    blocking: bool,
    install_signal_handlers: bool,
    state: Arc<RwLock<WorkerState>>,
    control_tx: mpsc::UnboundedSender<WorkerControl>,
    control_rx: mpsc::UnboundedReceiver<WorkerControl>,
    shutdown: bool,
    paused: bool,
}

impl Worker {
    /// Creates a worker for `queues`, highest priority first.
    ///
    /// A queue named `*` stands for every known queue, in name order.
    pub fn new(client: Resque, queues: Vec<String>) -> Self {
        let id = format!("{}:{}:{}", host_name(), std::process::id(), queues.join(","));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Self {
            registry: WorkerRegistry::new(&client),
            client,
            id,
            queues,
            isolation: Isolation::default(),
            interval: DEFAULT_INTERVAL,
            blocking: false,
            install_signal_handlers: false,
            state: Arc::new(RwLock::new(WorkerState::Starting)),
            control_tx,
            control_rx,
            shutdown: false,
            paused: false,
        }
    }

    /// Creates a worker from the `[worker]` config section.
    pub fn from_config(client: Resque, config: &WorkerConfig) -> Self {
        let mut worker = Self::new(client, config.queues.clone()).with_isolation(config.isolation.into());
        worker.interval = config.interval();
        worker.blocking = config.blocking;
        worker.install_signal_handlers = config.install_signal_handlers;
        worker
    }

    /// Sets how jobs are isolated.
    #[must_use]
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Translates OS signals into control messages while working.
    #[must_use]
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.install_signal_handlers = enabled;
        self
    }

    /// Worker id, `host:pid:queue1,queue2`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// A remote control for this worker.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id.clone(),
            tx: self.control_tx.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Queues to reserve from, with `*` expanded.
    pub async fn queues(&self) -> JobResult<Vec<String>> {
        if self.queues.iter().any(|q| q == ALL_QUEUES) {
            return self.client.queues().await;
        }
        Ok(self.queues.clone())
    }

    /// Adds this worker to the registry.
    pub async fn register_worker(&self) -> JobResult<()> {
        self.registry.register(&self.id).await
    }

    /// Removes this worker and its records from the registry.
    pub async fn unregister_worker(&self) -> JobResult<()> {
        self.registry.unregister(&self.id).await
    }

    /// Works with the configured interval and reservation mode.
    pub async fn run(&mut self) -> JobResult<()> {
        self.work(self.interval, self.blocking).await
    }

    /// Main loop. Returns once a shutdown was requested and the worker has
    /// unregistered.
    ///
    /// With `blocking` the worker waits on all its queues at once for up to
    /// `interval`; otherwise it polls them in order and sleeps `interval`
    /// when all are empty.
    pub async fn work(&mut self, interval: Duration, blocking: bool) -> JobResult<()> {
        self.register_worker().await?;
        let signals = if self.install_signal_handlers {
            match self.spawn_signal_listener() {
                Ok(signals) => Some(signals),
                Err(e) => {
                    if let Err(cleanup) = self.unregister_worker().await {
                        warn!(worker_id = %self.id, error = %cleanup, "Failed to unregister worker");
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        WorkerMetrics::worker_started();
        self.set_state(WorkerState::Waiting);
        info!(worker_id = %self.id, isolation = ?self.isolation, blocking = blocking, "Starting worker");

        while !self.shutdown {
            self.drain_control();
            if self.shutdown {
                break;
            }

            if self.paused {
                if let Some(control) = self.control_rx.recv().await {
                    self.apply_control(control);
                }
                continue;
            }

            let queues = match self.queues().await {
                Ok(queues) => queues,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to list queues");
                    tokio::time::sleep(interval).await;
                    continue;
                }
            };

            let (reserved, deferred) = self.reserve(&queues, interval, blocking).await;
            for control in deferred {
                self.apply_control(control);
            }

            match reserved {
                Some(Ok(Some(handler))) => {
                    if let Err(e) = self.process(handler).await {
                        error!(worker_id = %self.id, error = %e, "Failed to process job");
                        tokio::time::sleep(interval).await;
                    }
                }
                Some(Ok(None)) => {}
                Some(Err(e)) => {
                    error!(worker_id = %self.id, error = %e, "Failed to reserve job");
                    if e.is_store_fault() {
                        tokio::time::sleep(interval).await;
                    }
                }
                None => {
                    info!(worker_id = %self.id, "Reservation interrupted");
                }
            }
        }

        if let Some(signals) = signals {
            signals.abort();
        }

        self.set_state(WorkerState::ShuttingDown);
        let result = self.unregister_worker().await;
        self.set_state(WorkerState::Stopped);
        WorkerMetrics::worker_stopped();
        info!(worker_id = %self.id, "Worker stopped");
        result
    }

    /// Waits for a job. Returns `None` when interrupted by `ShutdownNow`,
    /// plus any other control messages received meanwhile.
    async fn reserve(
        &mut self,
        queues: &[String],
        interval: Duration,
        blocking: bool,
    ) -> (Option<JobResult<Option<JobHandler>>>, Vec<WorkerControl>) {
        let reservation = reserve_from(&self.client, queues, interval, blocking);
        tokio::pin!(reservation);

        let mut deferred = Vec::new();
        let reserved = loop {
            tokio::select! {
                reserved = &mut reservation => break Some(reserved),
                Some(control) = self.control_rx.recv() => {
                    deferred.push(control);
                    if control == WorkerControl::ShutdownNow {
                        break None;
                    }
                }
            }
        };
        (reserved, deferred)
    }

    /// Runs one reserved job to an outcome. Registry and counter writes that
    /// fail are logged; the job still runs and its outcome is recorded.
    async fn process(&mut self, mut handler: JobHandler) -> JobResult<()> {
        handler.set_worker(self.id.clone());
        info!(worker_id = %self.id, job = %handler, "Processing job");

        let before_fork = self.client.events().trigger(&Event::BeforeFork(&handler));
        if let Err(e) = before_fork {
            warn!(worker_id = %self.id, job_id = %handler.id(), error = %e, "Before-fork listener failed the job");
            if let Err(e) = handler.fail(&e).await {
                error!(worker_id = %self.id, error = %e, "Failed to record job outcome");
            }
            return self.done_working().await;
        }

        if let Err(e) = self.registry.set_working_on(&self.id, &handler).await {
            warn!(worker_id = %self.id, job_id = %handler.id(), error = %e, "Failed to write working-on marker");
        }
        self.set_state(WorkerState::Working);

        match self.isolation {
            Isolation::Task => self.supervise(handler).await,
            Isolation::Inline => {
                if let Err(e) = run_unit(handler).await {
                    error!(worker_id = %self.id, error = %e, "Failed to record job outcome");
                }
            }
        }

        if let Err(e) = self.registry.clear_working_on(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Failed to clear working-on marker");
        }
        self.done_working().await
    }

    /// Runs the job in its own task and waits for it, reacting to control
    /// messages meanwhile.
    async fn supervise(&mut self, handler: JobHandler) {
        let mut fallback = JobHandler::new(self.client.clone(), handler.queue(), handler.payload().clone());
        fallback.set_worker(self.id.clone());

        let handler = match self.client.reconnect().await {
            Ok(client) => handler.with_client(client),
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "Failed to open job connection, sharing the worker's");
                handler
            }
        };

        let span = info_span!("job", job_id = %handler.id(), class = %handler.class(), worker_id = %self.id);
        let mut unit = tokio::spawn(run_unit(handler).instrument(span));

        let joined = loop {
            tokio::select! {
                joined = &mut unit => break joined,
                Some(control) = self.control_rx.recv() => {
                    match control {
                        WorkerControl::KillChild | WorkerControl::ShutdownNow => {
                            info!(worker_id = %self.id, job_id = %fallback.id(), "Aborting job");
                            unit.abort();
                        }
                        _ => {}
                    }
                    self.apply_control(control);
                }
            }
        };

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(worker_id = %self.id, error = %e, "Failed to record job outcome"),
            Err(e) => {
                let fault = if e.is_cancelled() {
                    JobError::Aborted
                } else {
                    JobError::Panicked(e.to_string())
                };
                if let Err(e) = fallback.fail(&fault).await {
                    error!(worker_id = %self.id, error = %e, "Failed to record job outcome");
                }
            }
        }
    }

    async fn done_working(&mut self) -> JobResult<()> {
        if !self.shutdown {
            self.set_state(if self.paused { WorkerState::Paused } else { WorkerState::Waiting });
        }

        let stat = Stat::new(&self.client);
        let total = stat.incr("processed").await;
        let own = stat.incr(&format!("processed:{}", self.id)).await;
        total.and(own).map(drop)
    }

    fn drain_control(&mut self) {
        while let Ok(control) = self.control_rx.try_recv() {
            self.apply_control(control);
        }
    }

    fn apply_control(&mut self, control: WorkerControl) {
        debug!(worker_id = %self.id, control = ?control, "Control message");
        match control {
            WorkerControl::Shutdown | WorkerControl::ShutdownNow => {
                self.shutdown = true;
                self.set_state(WorkerState::ShuttingDown);
            }
            WorkerControl::Pause => {
                if !self.paused {
                    info!(worker_id = %self.id, "Pausing job processing");
                }
                self.paused = true;
                WorkerMetrics::update_paused(&self.id, true);
                if self.state() == WorkerState::Waiting {
                    self.set_state(WorkerState::Paused);
                }
            }
            WorkerControl::Resume => {
                if self.paused {
                    info!(worker_id = %self.id, "Resuming job processing");
                }
                self.paused = false;
                WorkerMetrics::update_paused(&self.id, false);
                if self.state() == WorkerState::Paused {
                    self.set_state(WorkerState::Waiting);
                }
            }
            // Only meaningful while a job is being supervised.
            WorkerControl::KillChild => {}
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    #[cfg(unix)]
    fn spawn_signal_listener(&self) -> JobResult<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        #[cfg(target_os = "linux")]
        const SIGCONT: i32 = 18;
        #[cfg(not(target_os = "linux"))]
        const SIGCONT: i32 = 19;

        let listen = |kind: SignalKind| {
            signal(kind).map_err(|e| JobError::Worker(format!("Failed to install signal handler: {e}")))
        };
        let mut quit = listen(SignalKind::quit())?;
        let mut terminate = listen(SignalKind::terminate())?;
        let mut interrupt = listen(SignalKind::interrupt())?;
        let mut usr1 = listen(SignalKind::user_defined1())?;
        let mut usr2 = listen(SignalKind::user_defined2())?;
        let mut cont = listen(SignalKind::from_raw(SIGCONT))?;

        let tx = self.control_tx.clone();
        let worker_id = self.id.clone();

        Ok(tokio::spawn(async move {
            loop {
                let control = tokio::select! {
                    _ = quit.recv() => WorkerControl::Shutdown,
                    _ = terminate.recv() => WorkerControl::ShutdownNow,
                    _ = interrupt.recv() => WorkerControl::ShutdownNow,
                    _ = usr1.recv() => WorkerControl::KillChild,
                    _ = usr2.recv() => WorkerControl::Pause,
                    _ = cont.recv() => WorkerControl::Resume,
                };
                info!(worker_id = %worker_id, control = ?control, "Signal received");
                if tx.send(control).is_err() {
                    break;
                }
            }
        }))
    }

    #[cfg(not(unix))]
    fn spawn_signal_listener(&self) -> JobResult<JoinHandle<()>> {
        let tx = self.control_tx.clone();
        Ok(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(WorkerControl::ShutdownNow);
            }
        }))
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

async fn reserve_from(
    client: &Resque,
    queues: &[String],
    interval: Duration,
    blocking: bool,
) -> JobResult<Option<JobHandler>> {
    if blocking {
        return JobHandler::reserve_blocking(client, queues, interval).await;
    }

    for queue in queues {
        if let Some(handler) = JobHandler::reserve(client, queue).await? {
            return Ok(Some(handler));
        }
    }

    tokio::time::sleep(interval).await;
    Ok(None)
}

/// Body of an isolated unit. Every outcome other than success or a veto ends
/// in `fail`.
async fn run_unit(mut handler: JobHandler) -> JobResult<()> {
    match AssertUnwindSafe(execute(&mut handler)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(fault)) => handler.fail(&fault).await,
        Err(panic) => {
            let fault = JobError::Panicked(panic_message(panic.as_ref()));
            handler.fail(&fault).await
        }
    }
}

async fn execute(handler: &mut JobHandler) -> JobResult<()> {
    handler.client().events().trigger(&Event::AfterFork(&*handler))?;
    handler.update_status(StatusCode::Running, None).await?;

    if handler.perform().await? {
        handler.update_status(StatusCode::Complete, None).await?;
        info!(job_id = %handler.id(), class = %handler.class(), "Job completed");
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
