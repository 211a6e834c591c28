mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{eventually, faulty_client};
use resque_jobs::{JobError, JobResult, RedisFailureBackend, StatusCode, Worker, WorkerHandle, WorkerRegistry, WorkerState};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

fn start(worker: Worker, blocking: bool) -> (WorkerHandle, JoinHandle<JobResult<()>>) {
    let handle = worker.handle();
    let mut worker = worker;
    let join = tokio::spawn(async move { worker.work(Duration::from_millis(10), blocking).await });
    (handle, join)
}

async fn stop(handle: &WorkerHandle, join: JoinHandle<JobResult<()>>) {
    handle.shutdown();
    let stopped = tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_ok!(stopped);
}

async fn worker_retries_after_reservation_fault(op: &'static str, blocking: bool) {
    let (client, store) = faulty_client();
    let id = client
        .enqueue("jobs", "Test_Job", Value::Null, true, "")
        .await
        .unwrap()
        .unwrap();
    store.fail(op);

    let (handle, join) = start(Worker::new(client.clone(), vec!["jobs".to_string()]), blocking);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!join.is_finished());
    assert_eq!(handle.state(), WorkerState::Waiting);
    assert_eq!(client.size("jobs").await.unwrap(), 1);

    store.recover();
    assert!(eventually(|| {
        let client = client.clone();
        async move { client.stat().get("processed").await.unwrap() == 1 }
    })
    .await);
    stop(&handle, join).await;

    assert_eq!(client.status(id, "").get().await.unwrap(), Some(StatusCode::Complete));
}

#[tokio::test]
async fn test_worker_retries_after_pop_fault() {
    worker_retries_after_reservation_fault("pop", false).await;
}

#[tokio::test]
async fn test_worker_retries_after_blocking_pop_fault() {
    worker_retries_after_reservation_fault("blocking_pop", true).await;
}

#[tokio::test]
async fn test_working_on_marker_fault_still_runs_job() {
    let (client, store) = faulty_client();
    let id = client
        .enqueue("jobs", "Test_Job", Value::Null, true, "")
        .await
        .unwrap()
        .unwrap();

    let worker = Worker::new(client.clone(), vec!["jobs".to_string()]);
    store.fail_key("set", client.keys().worker(worker.id()));
    let (handle, join) = start(worker, false);

    assert!(eventually(|| {
        let client = client.clone();
        async move { client.stat().get("processed").await.unwrap() == 1 }
    })
    .await);
    stop(&handle, join).await;

    assert_eq!(client.size("jobs").await.unwrap(), 0);
    assert_eq!(client.status(id, "").get().await.unwrap(), Some(StatusCode::Complete));
    assert_eq!(RedisFailureBackend::count(&client).await.unwrap(), 0);
}

#[tokio::test]
async fn test_fail_records_everything_despite_status_fault() {
    let (client, store) = faulty_client();
    let id = client
        .enqueue("jobs", "Failing_Job", Value::Null, true, "")
        .await
        .unwrap()
        .unwrap();
    let mut handler = client.reserve("jobs").await.unwrap().unwrap();
    handler.set_worker("host:1:jobs");

    store.fail_key("replace", client.keys().status("", id.as_str()));
    let result = handler.fail(&JobError::execution("boom")).await;
    assert!(matches!(result, Err(JobError::Store(_))));

    assert_eq!(RedisFailureBackend::count(&client).await.unwrap(), 1);
    assert_eq!(client.stat().get("failed").await.unwrap(), 1);
    assert_eq!(client.stat().get("failed:host:1:jobs").await.unwrap(), 1);
}

#[tokio::test]
async fn test_registration_fault_stops_worker_before_start() {
    let (client, store) = faulty_client();
    store.fail_key("set_add", client.keys().workers());

    let mut worker = Worker::new(client.clone(), vec!["jobs".to_string()]).with_signal_handlers(true);
    let result = worker.work(Duration::from_millis(10), false).await;

    assert_err!(result);
    assert_eq!(worker.state(), WorkerState::Starting);
    store.recover();
    assert!(!WorkerRegistry::new(&client).exists(worker.id()).await.unwrap());
}

#[tokio::test]
async fn test_promotion_fault_keeps_delayed_jobs() {
    let (client, store) = faulty_client();
    let at = Utc::now() - ChronoDuration::seconds(5);
    for n in 0..3 {
        client.enqueue_at(at, "jobs", "Test_Job", json!({"n": n})).await.unwrap();
    }

    store.fail("promote_delayed");
    let scheduler = client.scheduler();
    assert_err!(scheduler.promote_due(Utc::now()).await);
    assert_eq!(client.delayed_queue_schedule_size().await.unwrap(), 3);
    assert_eq!(client.size("jobs").await.unwrap(), 0);

    store.recover();
    assert_eq!(scheduler.promote_due(Utc::now()).await.unwrap(), 3);
    assert_eq!(client.delayed_queue_schedule_size().await.unwrap(), 0);

    let ns: Vec<i64> = client
        .items("jobs", 0, -1)
        .await
        .unwrap()
        .iter()
        .filter_map(|p| p.args["n"].as_i64())
        .collect();
    assert_eq!(ns, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_promotion_ignores_queue_push_faults() {
    let (client, store) = faulty_client();
    let at = Utc::now() - ChronoDuration::seconds(5);
    for n in 0..3 {
        client.enqueue_at(at, "jobs", "Test_Job", json!({"n": n})).await.unwrap();
    }

    store.fail_key("push", client.keys().queue("jobs"));
    assert_eq!(client.scheduler().promote_due(Utc::now()).await.unwrap(), 3);
    assert_eq!(client.delayed_queue_schedule_size().await.unwrap(), 0);
    assert_eq!(client.size("jobs").await.unwrap(), 3);
}

#[tokio::test]
async fn test_scheduler_loop_survives_store_fault() {
    let (client, store) = faulty_client();
    client
        .enqueue_at(Utc::now() - ChronoDuration::seconds(5), "jobs", "Test_Job", Value::Null)
        .await
        .unwrap();
    store.fail("sorted_range_by_score");

    let scheduler = client.scheduler().with_poll_interval(Duration::from_millis(10));
    let runner = scheduler.clone();
    let loop_handle = tokio::spawn(async move { runner.start().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scheduler.is_running());
    assert_eq!(client.size("jobs").await.unwrap(), 0);

    store.recover();
    assert!(eventually(|| {
        let client = client.clone();
        async move { client.size("jobs").await.unwrap() == 1 }
    })
    .await);

    scheduler.stop();
    assert_ok!(loop_handle.await.unwrap());
    assert!(!scheduler.is_running());
}
