//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use resque_jobs::{Job, JobContext, JobError, JobRegistry, JobResult, MemoryStore, Promotion, Resque, Store};
use std::sync::Arc;
use std::time::Duration;

/// Does nothing.
pub struct TestJob;

#[async_trait]
impl Job for TestJob {
    async fn perform(&mut self, _ctx: &JobContext) -> JobResult<()> {
        Ok(())
    }
}

/// Always fails.
pub struct FailingJob;

#[async_trait]
impl Job for FailingJob {
    async fn perform(&mut self, _ctx: &JobContext) -> JobResult<()> {
        Err(JobError::execution("failing job"))
    }
}

/// Panics in `perform`.
pub struct PanickingJob;

#[async_trait]
impl Job for PanickingJob {
    async fn perform(&mut self, _ctx: &JobContext) -> JobResult<()> {
        panic!("panicking job");
    }
}

/// Sleeps for `ms` milliseconds.
pub struct SlowJob {
    ms: u64,
}

#[async_trait]
impl Job for SlowJob {
    async fn perform(&mut self, _ctx: &JobContext) -> JobResult<()> {
        tokio::time::sleep(Duration::from_millis(self.ms)).await;
        Ok(())
    }
}

pub fn registry() -> JobRegistry {
    let registry = JobRegistry::new();
    registry
        .register("Test_Job", |_| Ok(Box::new(TestJob) as Box<dyn Job>))
        .register("Failing_Job", |_| Ok(Box::new(FailingJob) as Box<dyn Job>))
        .register("Panicking_Job", |_| Ok(Box::new(PanickingJob) as Box<dyn Job>))
        .register("Slow_Job", |ctx| {
            let ms = ctx.arg("ms").and_then(|v| v.as_u64()).unwrap_or(100);
            Ok(Box::new(SlowJob { ms }) as Box<dyn Job>)
        });
    registry
}

/// Client over a fresh in-memory store with the test jobs registered.
pub fn client() -> Resque {
    Resque::new(Arc::new(MemoryStore::new()), "test").with_factory(registry())
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// In-memory store whose operations can be made to fail on demand.
///
/// A fault names a [`Store`] method and optionally one exact key; matching
/// calls return a store error until [`FaultyStore::recover`]. Reconnected
/// handles share data and faults.
#[derive(Clone, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Arc<Mutex<Vec<(&'static str, Option<String>)>>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every call to `op`.
    pub fn fail(&self, op: &'static str) {
        self.faults.lock().push((op, None));
    }

    /// Fails calls to `op` on `key` only.
    pub fn fail_key(&self, op: &'static str, key: impl Into<String>) {
        self.faults.lock().push((op, Some(key.into())));
    }

    /// Clears all faults.
    pub fn recover(&self) {
        self.faults.lock().clear();
    }

    fn check(&self, op: &str, key: &str) -> JobResult<()> {
        let faulty = self
            .faults
            .lock()
            .iter()
            .any(|(o, k)| *o == op && k.as_deref().map_or(true, |k| k == key));
        if faulty {
            return Err(JobError::Store(format!("injected fault: {op} {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn push(&self, key: &str, value: &str) -> JobResult<u64> {
        self.check("push", key)?;
        self.inner.push(key, value).await
    }

    async fn pop(&self, key: &str) -> JobResult<Option<String>> {
        self.check("pop", key)?;
        self.inner.pop(key).await
    }

    async fn blocking_pop(&self, keys: &[String], timeout: Duration) -> JobResult<Option<(String, String)>> {
        self.check("blocking_pop", &keys.join(","))?;
        self.inner.blocking_pop(keys, timeout).await
    }

    async fn list_len(&self, key: &str) -> JobResult<u64> {
        self.check("list_len", key)?;
        self.inner.list_len(key).await
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> JobResult<Vec<String>> {
        self.check("list_range", key)?;
        self.inner.list_range(key, start, stop).await
    }

    async fn list_remove(&self, key: &str, value: &str) -> JobResult<u64> {
        self.check("list_remove", key)?;
        self.inner.list_remove(key, value).await
    }

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> JobResult<()> {
        self.check("sorted_add", key)?;
        self.inner.sorted_add(key, score, member).await
    }

    async fn sorted_range_by_score(&self, key: &str, max: i64, limit: Option<usize>) -> JobResult<Vec<String>> {
        self.check("sorted_range_by_score", key)?;
        self.inner.sorted_range_by_score(key, max, limit).await
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> JobResult<bool> {
        self.check("sorted_remove", key)?;
        self.inner.sorted_remove(key, member).await
    }

    async fn sorted_card(&self, key: &str) -> JobResult<u64> {
        self.check("sorted_card", key)?;
        self.inner.sorted_card(key).await
    }

    async fn promote_delayed(
        &self,
        list: &str,
        index: &str,
        member: &str,
        queues: &str,
        queue_prefix: &str,
    ) -> JobResult<Promotion> {
        self.check("promote_delayed", list)?;
        self.inner.promote_delayed(list, index, member, queues, queue_prefix).await
    }

    async fn unindex_if_empty(&self, list: &str, index: &str, member: &str) -> JobResult<bool> {
        self.check("unindex_if_empty", list)?;
        self.inner.unindex_if_empty(list, index, member).await
    }

    async fn get(&self, key: &str) -> JobResult<Option<String>> {
        self.check("get", key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<()> {
        self.check("set", key)?;
        self.inner.set(key, value, ttl).await
    }

    async fn replace(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<bool> {
        self.check("replace", key)?;
        self.inner.replace(key, value, ttl).await
    }

    async fn ttl(&self, key: &str) -> JobResult<Option<Duration>> {
        self.check("ttl", key)?;
        self.inner.ttl(key).await
    }

    async fn delete(&self, key: &str) -> JobResult<bool> {
        self.check("delete", key)?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> JobResult<bool> {
        self.check("exists", key)?;
        self.inner.exists(key).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> JobResult<i64> {
        self.check("incr_by", key)?;
        self.inner.incr_by(key, delta).await
    }

    async fn set_add(&self, key: &str, member: &str) -> JobResult<bool> {
        self.check("set_add", key)?;
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> JobResult<bool> {
        self.check("set_remove", key)?;
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> JobResult<Vec<String>> {
        self.check("set_members", key)?;
        self.inner.set_members(key).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> JobResult<bool> {
        self.check("set_contains", key)?;
        self.inner.set_contains(key, member).await
    }

    async fn keys_by_prefix(&self, prefix: &str) -> JobResult<Vec<String>> {
        self.check("keys_by_prefix", prefix)?;
        self.inner.keys_by_prefix(prefix).await
    }

    async fn reconnect(&self) -> JobResult<Arc<dyn Store>> {
        self.check("reconnect", "")?;
        Ok(Arc::new(self.clone()))
    }

    async fn ping(&self) -> JobResult<()> {
        self.check("ping", "")?;
        self.inner.ping().await
    }
}

/// Client over a [`FaultyStore`] with the test jobs registered.
pub fn faulty_client() -> (Resque, FaultyStore) {
    let store = FaultyStore::new();
    let client = Resque::new(Arc::new(store.clone()), "test").with_factory(registry());
    (client, store)
}
