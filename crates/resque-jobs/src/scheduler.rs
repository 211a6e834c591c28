//! Delayed job schedule.
//!
//! Delayed payloads live in one list per unix timestamp (`delayed:<ts>`),
//! and the timestamps themselves in the sorted set `delayed_queue_schedule`.
//! The promoter repeatedly takes the smallest due timestamp and, in one
//! atomic store step, moves its payloads onto their live queues and drops
//! the list and its index entry. A store fault leaves the timestamp intact
//! for the next scan.

use crate::client::Resque;
use crate::error::{JobError, JobResult};
use crate::metrics::SchedulerMetrics;
use crate::payload::{normalize_args, JobArgs, Payload};
use chrono::{DateTime, Utc};
use resque_config::SchedulerConfig;
use resque_core::JobId;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Delayed-schedule manager and promoter.
#[derive(Clone)]
pub struct Scheduler {
    client: Resque,
    poll_interval: Duration,
    enabled: bool,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(client: Resque) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            enabled: true,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a scheduler from the `[scheduler]` config section.
    pub fn from_config(client: Resque, config: &SchedulerConfig) -> Self {
        let mut scheduler = Self::new(client).with_poll_interval(config.poll_interval());
        scheduler.enabled = config.enabled;
        scheduler
    }

    /// Sets the sleep between two promotion scans.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Schedules a job to be pushed onto `queue` at `at`.
    pub async fn enqueue_at(&self, at: DateTime<Utc>, queue: &str, class: &str, args: Value) -> JobResult<JobId> {
        let args = normalize_args(args)?;
        let id = self.client.generate_job_id();
        let payload = Payload::new(queue, class, args, id.clone());
        let timestamp = at.timestamp();
        let keys = self.client.keys();

        // List first: the index entry must never point at nothing
        self.client
            .store()
            .push(&keys.delayed(timestamp), &payload.to_json()?)
            .await?;
        self.client
            .store()
            .sorted_add(&keys.delayed_schedule(), timestamp, &timestamp.to_string())
            .await?;

        SchedulerMetrics::job_delayed(queue, class);
        debug!(job_id = %id, queue = %queue, class = %class, timestamp = timestamp, "Delayed job");
        Ok(id)
    }

    /// Schedules a job to be pushed onto `queue` after `delay`.
    pub async fn enqueue_in(&self, delay: Duration, queue: &str, class: &str, args: Value) -> JobResult<JobId> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| JobError::Internal(format!("delay out of range: {e}")))?;
        self.enqueue_at(Utc::now() + delay, queue, class, args).await
    }

    /// Smallest scheduled timestamp not later than `now`.
    pub async fn next_delayed_timestamp(&self, now: DateTime<Utc>) -> JobResult<Option<i64>> {
        let members = self
            .client
            .store()
            .sorted_range_by_score(&self.client.keys().delayed_schedule(), now.timestamp(), Some(1))
            .await?;
        Ok(members.first().and_then(|m| m.parse().ok()))
    }

    /// Moves every payload due at or before `now` onto its live queue.
    /// Returns the number of payloads promoted.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> JobResult<u64> {
        let keys = self.client.keys();
        let mut promoted = 0u64;

        while let Some(timestamp) = self.next_delayed_timestamp(now).await? {
            let promotion = self
                .client
                .store()
                .promote_delayed(
                    &keys.delayed(timestamp),
                    &keys.delayed_schedule(),
                    &timestamp.to_string(),
                    &keys.queues(),
                    &keys.queue(""),
                )
                .await?;

            for raw in &promotion.rejected {
                error!(timestamp = timestamp, payload = %raw, "Dropped delayed payload without a queue");
            }
            for raw in &promotion.moved {
                promoted += 1;
                match Payload::from_json(raw) {
                    Ok(payload) => {
                        let queue = payload.queue.as_deref().unwrap_or_default();
                        SchedulerMetrics::job_promoted(queue, &payload.class);
                        debug!(job_id = %payload.id, queue = %queue, timestamp = timestamp, "Promoted delayed job");
                    }
                    Err(e) => warn!(timestamp = timestamp, error = %e, "Promoted a payload workers cannot decode"),
                }
            }
        }

        if promoted > 0 {
            info!(count = promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Removes delayed payloads matching `(queue, class, args)` at every
    /// timestamp. Argument mappings compare without regard to key order.
    pub async fn remove_delayed(&self, queue: &str, class: &str, args: Value) -> JobResult<u64> {
        let args = normalize_args(args)?;
        let timestamps = self
            .client
            .store()
            .sorted_range_by_score(&self.client.keys().delayed_schedule(), i64::MAX, None)
            .await?;

        let mut removed = 0;
        for member in timestamps {
            let Ok(timestamp) = member.parse::<i64>() else {
                warn!(member = %member, "Ignoring malformed delayed schedule entry");
                continue;
            };
            removed += self.remove_at(timestamp, queue, class, &args).await?;
        }
        Ok(removed)
    }

    /// Removes delayed payloads matching `(queue, class, args)` scheduled at
    /// `at`.
    pub async fn remove_delayed_job_from_timestamp(
        &self,
        at: DateTime<Utc>,
        queue: &str,
        class: &str,
        args: Value,
    ) -> JobResult<u64> {
        let args = normalize_args(args)?;
        self.remove_at(at.timestamp(), queue, class, &args).await
    }

    async fn remove_at(&self, timestamp: i64, queue: &str, class: &str, args: &JobArgs) -> JobResult<u64> {
        let store = self.client.store();
        let keys = self.client.keys();
        let list = keys.delayed(timestamp);

        let mut removed = 0;
        for raw in store.list_range(&list, 0, -1).await? {
            let matches = Payload::from_json(&raw).is_ok_and(|p| p.matches(queue, class, args));
            if matches {
                removed += store.list_remove(&list, &raw).await?;
            }
        }

        if removed > 0 {
            store
                .unindex_if_empty(&list, &keys.delayed_schedule(), &timestamp.to_string())
                .await?;
            debug!(timestamp = timestamp, removed = removed, "Removed delayed jobs");
        }
        Ok(removed)
    }

    /// Total number of delayed payloads across all timestamps.
    pub async fn delayed_queue_schedule_size(&self) -> JobResult<u64> {
        let store = self.client.store();
        let keys = self.client.keys();
        let timestamps = store
            .sorted_range_by_score(&keys.delayed_schedule(), i64::MAX, None)
            .await?;

        let mut total = 0;
        for member in timestamps {
            if let Ok(timestamp) = member.parse::<i64>() {
                total += store.list_len(&keys.delayed(timestamp)).await?;
            }
        }
        Ok(total)
    }

    /// Number of payloads scheduled at `at`.
    pub async fn delayed_timestamp_size(&self, at: DateTime<Utc>) -> JobResult<u64> {
        self.client
            .store()
            .list_len(&self.client.keys().delayed(at.timestamp()))
            .await
    }

    /// Scan interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether [`Scheduler::start`] runs the promoter loop.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Runs the promoter until [`Scheduler::stop`] is called. Returns at once
    /// when the promoter is disabled.
    pub async fn start(&self) -> JobResult<()> {
        if !self.enabled {
            info!("Scheduler disabled, not promoting delayed jobs");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Scheduler already running".to_string()));
        }
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.run(shutdown_rx).await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Runs the promoter until `shutdown` fires or its sender is dropped.
    ///
    /// Store faults are logged and the next tick retries.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(poll_interval = ?self.poll_interval, "Starting scheduler");

        let mut poll_interval = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }

                _ = poll_interval.tick() => {
                    if let Err(e) = self.promote_due(Utc::now()).await {
                        error!(error = %e, "Failed to promote delayed jobs");
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Stop the scheduler.
    pub fn stop(&self) {
        info!("Stopping scheduler...");
        let _ = self.shutdown_tx.send(());
    }

    /// Check if the promoter loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
