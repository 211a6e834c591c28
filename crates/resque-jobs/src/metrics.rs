//! Prometheus metrics for queue and worker monitoring.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "resque_jobs_enqueued_total";
    /// Total jobs reserved by a worker.
    pub const JOBS_RESERVED_TOTAL: &str = "resque_jobs_reserved_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "resque_jobs_completed_total";
    /// Total jobs failed.
    pub const JOBS_FAILED_TOTAL: &str = "resque_jobs_failed_total";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "resque_job_duration_seconds";
    /// Time between enqueue and reservation in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "resque_job_wait_time_seconds";

    /// Total jobs placed on the delayed schedule.
    pub const SCHEDULER_JOBS_DELAYED_TOTAL: &str = "resque_scheduler_jobs_delayed_total";
    /// Total delayed jobs promoted onto a live queue.
    pub const SCHEDULER_JOBS_PROMOTED_TOTAL: &str = "resque_scheduler_jobs_promoted_total";

    /// Workers running in this process.
    pub const WORKERS_ACTIVE: &str = "resque_workers_active";
    /// Whether a worker is paused.
    pub const WORKER_PAUSED: &str = "resque_worker_paused";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_RESERVED_TOTAL, "Total number of jobs reserved by workers");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Time between enqueue and reservation in seconds"
    );

    describe_counter!(
        names::SCHEDULER_JOBS_DELAYED_TOTAL,
        "Total number of jobs placed on the delayed schedule"
    );
    describe_counter!(
        names::SCHEDULER_JOBS_PROMOTED_TOTAL,
        "Total number of delayed jobs moved onto their queue"
    );

    describe_gauge!(names::WORKERS_ACTIVE, "Number of running workers");
    describe_gauge!(names::WORKER_PAUSED, "Whether the worker is paused (1) or not (0)");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, class: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Record a job reserved.
    pub fn job_reserved(queue: &str, class: &str) {
        counter!(
            names::JOBS_RESERVED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, class: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "class" => class.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed.
    pub fn job_failed(queue: &str, class: &str, error_type: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "class" => class.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record job wait time.
    pub fn job_wait_time(queue: &str, class: &str, wait_time: Duration) {
        histogram!(
            names::JOB_WAIT_TIME_SECONDS,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .record(wait_time.as_secs_f64());
    }
}

/// Scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a job placed on the delayed schedule.
    pub fn job_delayed(queue: &str, class: &str) {
        counter!(
            names::SCHEDULER_JOBS_DELAYED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Record a delayed job promoted.
    pub fn job_promoted(queue: &str, class: &str) {
        counter!(
            names::SCHEDULER_JOBS_PROMOTED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a worker starting.
    pub fn worker_started() {
        gauge!(names::WORKERS_ACTIVE).increment(1.0);
    }

    /// Record a worker stopping.
    pub fn worker_stopped() {
        gauge!(names::WORKERS_ACTIVE).decrement(1.0);
    }

    /// Update the paused flag.
    pub fn update_paused(worker_id: &str, paused: bool) {
        gauge!(
            names::WORKER_PAUSED,
            "worker_id" => worker_id.to_string()
        )
        .set(if paused { 1.0 } else { 0.0 });
    }
}
