mod common;

use common::{client, eventually};
use resque_jobs::{
    Isolation, JobResult, RedisFailureBackend, StatusCode, Worker, WorkerHandle, WorkerRegistry, WorkerState,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task::JoinHandle;

fn start(worker: Worker, interval: Duration, blocking: bool) -> (WorkerHandle, JoinHandle<JobResult<()>>) {
    let handle = worker.handle();
    let mut worker = worker;
    let join = tokio::spawn(async move { worker.work(interval, blocking).await });
    (handle, join)
}

async fn stop(handle: &WorkerHandle, join: JoinHandle<JobResult<()>>) {
    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_panicking_job_becomes_one_failure() {
    let client = client();
    let id = client
        .enqueue("jobs", "Panicking_Job", Value::Null, true, "")
        .await
        .unwrap()
        .unwrap();
    client.enqueue("jobs", "Test_Job", Value::Null, false, "").await.unwrap();

    let worker = Worker::new(client.clone(), vec!["jobs".to_string()]);
    let worker_id = worker.id().to_string();
    let (handle, join) = start(worker, Duration::from_millis(10), false);

    assert!(eventually(|| {
        let client = client.clone();
        async move { client.stat().get("processed").await.unwrap() == 2 }
    })
    .await);
    stop(&handle, join).await;

    assert_eq!(RedisFailureBackend::count(&client).await.unwrap(), 1);
    let record = &RedisFailureBackend::all(&client, 0, -1).await.unwrap()[0];
    assert_eq!(record.exception, "Panicked");
    assert!(record.error.contains("panicking job"));
    assert_eq!(record.worker, worker_id);
    assert_eq!(client.status(id, "").get().await.unwrap(), Some(StatusCode::Failed));
    assert_eq!(client.stat().get("failed").await.unwrap(), 1);
}

#[tokio::test]
async fn test_successful_job_completes() {
    let client = client();
    let id = client
        .enqueue("jobs", "Test_Job", json!({"a": 1}), true, "")
        .await
        .unwrap()
        .unwrap();

    let (handle, join) = start(
        Worker::new(client.clone(), vec!["jobs".to_string()]),
        Duration::from_millis(10),
        true,
    );

    let status = client.status(id, "");
    assert!(eventually(|| {
        let status = status.clone();
        async move { status.get().await.unwrap() == Some(StatusCode::Complete) }
    })
    .await);
    stop(&handle, join).await;

    assert_eq!(RedisFailureBackend::count(&client).await.unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_now_interrupts_blocking_wait() {
    let client = client();
    let (handle, join) = start(
        Worker::new(client.clone(), vec!["empty".to_string()]),
        Duration::from_secs(600),
        true,
    );

    assert!(eventually(|| {
        let handle = handle.clone();
        async move { handle.state() == WorkerState::Waiting }
    })
    .await);

    handle.shutdown_now();
    tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("blocked worker did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(handle.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_current_job() {
    let client = client();
    let id = client
        .enqueue("jobs", "Slow_Job", json!({"ms": 200}), true, "")
        .await
        .unwrap()
        .unwrap();

    let worker = Worker::new(client.clone(), vec!["jobs".to_string()]);
    let worker_id = worker.id().to_string();
    let (handle, join) = start(worker, Duration::from_millis(10), false);

    assert!(eventually(|| {
        let handle = handle.clone();
        async move { handle.state() == WorkerState::Working }
    })
    .await);

    let registry = WorkerRegistry::new(&client);
    let marker = registry.working_on(&worker_id).await.unwrap().unwrap();
    assert_eq!(marker.payload.id, id);

    stop(&handle, join).await;

    assert_eq!(client.status(id, "").get().await.unwrap(), Some(StatusCode::Complete));
    assert_eq!(client.stat().get("processed").await.unwrap(), 1);
    assert!(!registry.exists(&worker_id).await.unwrap());
    assert!(registry.working_on(&worker_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_kill_child_aborts_job_and_keeps_working() {
    let client = client();
    let id = client
        .enqueue("jobs", "Slow_Job", json!({"ms": 60_000}), true, "")
        .await
        .unwrap()
        .unwrap();

    let (handle, join) = start(
        Worker::new(client.clone(), vec!["jobs".to_string()]),
        Duration::from_millis(10),
        false,
    );

    assert!(eventually(|| {
        let handle = handle.clone();
        async move { handle.state() == WorkerState::Working }
    })
    .await);
    handle.kill_child();

    assert!(eventually(|| {
        let client = client.clone();
        async move { RedisFailureBackend::count(&client).await.unwrap() == 1 }
    })
    .await);
    assert_eq!(
        RedisFailureBackend::all(&client, 0, -1).await.unwrap()[0].exception,
        "Aborted"
    );
    assert_eq!(client.status(id, "").get().await.unwrap(), Some(StatusCode::Failed));

    assert!(eventually(|| {
        let handle = handle.clone();
        async move { handle.state() == WorkerState::Waiting }
    })
    .await);
    stop(&handle, join).await;
}

#[tokio::test]
async fn test_pause_stops_reservation_until_resume() {
    let client = client();
    let worker = Worker::new(client.clone(), vec!["jobs".to_string()]);
    let handle = worker.handle();
    handle.pause();
    let (handle, join) = start(worker, Duration::from_millis(10), false);

    assert!(eventually(|| {
        let handle = handle.clone();
        async move { handle.state() == WorkerState::Paused }
    })
    .await);

    client.enqueue("jobs", "Test_Job", Value::Null, false, "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.size("jobs").await.unwrap(), 1);

    handle.resume();
    assert!(eventually(|| {
        let client = client.clone();
        async move { client.stat().get("processed").await.unwrap() == 1 }
    })
    .await);
    assert_eq!(client.size("jobs").await.unwrap(), 0);

    stop(&handle, join).await;
}

#[tokio::test]
async fn test_inline_isolation_records_failure() {
    let client = client();
    client.enqueue("jobs", "Failing_Job", Value::Null, false, "").await.unwrap();

    let worker = Worker::new(client.clone(), vec!["jobs".to_string()]).with_isolation(Isolation::Inline);
    let (handle, join) = start(worker, Duration::from_millis(10), false);

    assert!(eventually(|| {
        let client = client.clone();
        async move { RedisFailureBackend::count(&client).await.unwrap() == 1 }
    })
    .await);
    stop(&handle, join).await;

    assert_eq!(client.stat().get("failed").await.unwrap(), 1);
    assert_eq!(client.stat().get("processed").await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_class_fails_without_stopping_worker() {
    let client = client();
    client.enqueue("jobs", "Missing_Job", Value::Null, false, "").await.unwrap();
    client.enqueue("jobs", "Test_Job", Value::Null, false, "").await.unwrap();

    let (handle, join) = start(
        Worker::new(client.clone(), vec!["jobs".to_string()]),
        Duration::from_millis(10),
        false,
    );

    assert!(eventually(|| {
        let client = client.clone();
        async move { client.stat().get("processed").await.unwrap() == 2 }
    })
    .await);
    stop(&handle, join).await;

    let record = &RedisFailureBackend::all(&client, 0, -1).await.unwrap()[0];
    assert_eq!(record.exception, "ClassNotFound");
}
