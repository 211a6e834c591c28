//! Backing store adapter.
//!
//! Everything the library persists goes through the [`Store`] trait: plain
//! lists for queues, a sorted index plus per-timestamp lists for the delayed
//! schedule, strings for status records and counters, and sets for the queue
//! and worker registries. Each method maps to one atomic store operation.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::{create_pool, RedisStore};

use crate::error::JobResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Atomic operations consumed from the backing store.
///
/// Keys are passed fully qualified; build them with [`KeySpace`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Appends to the tail of a list. Returns the new length.
    async fn push(&self, key: &str, value: &str) -> JobResult<u64>;

    /// Removes and returns the head of a list.
    async fn pop(&self, key: &str) -> JobResult<Option<String>>;

    /// Pops the head of the first non-empty list among `keys`, waiting up to
    /// `timeout`. Returns the key that was served together with the value,
    /// or `None` once the timeout expires.
    async fn blocking_pop(&self, keys: &[String], timeout: Duration) -> JobResult<Option<(String, String)>>;

    /// Length of a list.
    async fn list_len(&self, key: &str) -> JobResult<u64>;

    /// Range of a list with inclusive, possibly negative, bounds.
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> JobResult<Vec<String>>;

    /// Removes the first occurrence of `value`. Returns the number removed.
    async fn list_remove(&self, key: &str, value: &str) -> JobResult<u64>;

    /// Adds `member` with `score` to a sorted set.
    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> JobResult<()>;

    /// Members with score at most `max`, lowest first, at most `limit` of them.
    async fn sorted_range_by_score(&self, key: &str, max: i64, limit: Option<usize>) -> JobResult<Vec<String>>;

    /// Removes `member` from a sorted set.
    async fn sorted_remove(&self, key: &str, member: &str) -> JobResult<bool>;

    /// Number of members of a sorted set.
    async fn sorted_card(&self, key: &str) -> JobResult<u64>;

    /// Moves every payload of the delayed list `list` onto its live queue,
    /// then deletes `list` and removes `member` from the sorted set `index`,
    /// all in one atomic step.
    ///
    /// A payload is routed by its `queue` field to the list
    /// `<queue_prefix><queue>`, and the queue name is added to the set
    /// `queues`. Payloads that are not JSON objects with a non-empty string
    /// `queue` are dropped and reported in [`Promotion::rejected`].
    async fn promote_delayed(
        &self,
        list: &str,
        index: &str,
        member: &str,
        queues: &str,
        queue_prefix: &str,
    ) -> JobResult<Promotion>;

    /// Removes `member` from `index` only if the list at `list` is empty.
    async fn unindex_if_empty(&self, list: &str, index: &str, member: &str) -> JobResult<bool>;

    /// Reads a string value.
    async fn get(&self, key: &str) -> JobResult<Option<String>>;

    /// Writes a string value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<()>;

    /// Overwrites a string value only if the key already exists.
    async fn replace(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<bool>;

    /// Remaining time to live of a key, `None` if missing or persistent.
    async fn ttl(&self, key: &str) -> JobResult<Option<Duration>>;

    /// Deletes a key of any type.
    async fn delete(&self, key: &str) -> JobResult<bool>;

    /// Checks whether a key exists.
    async fn exists(&self, key: &str) -> JobResult<bool>;

    /// Atomically adds `delta` to an integer counter. Returns the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> JobResult<i64>;

    /// Adds a member to a set. Returns true if it was not present.
    async fn set_add(&self, key: &str, member: &str) -> JobResult<bool>;

    /// Removes a member from a set.
    async fn set_remove(&self, key: &str, member: &str) -> JobResult<bool>;

    /// All members of a set.
    async fn set_members(&self, key: &str) -> JobResult<Vec<String>>;

    /// Set membership test.
    async fn set_contains(&self, key: &str, member: &str) -> JobResult<bool>;

    /// All keys starting with `prefix`.
    async fn keys_by_prefix(&self, prefix: &str) -> JobResult<Vec<String>>;

    /// Opens an independent handle for an isolated execution unit.
    async fn reconnect(&self) -> JobResult<Arc<dyn Store>>;

    /// Round-trip check.
    async fn ping(&self) -> JobResult<()>;
}

/// Outcome of [`Store::promote_delayed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Promotion {
    /// Raw payloads pushed onto a live queue, in list order.
    pub moved: Vec<String>,
    /// Raw payloads that could not be routed and were dropped.
    pub rejected: Vec<String>,
}

/// Queue name a delayed payload is routed to, if it has one.
pub(crate) fn delayed_route(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value.get("queue")?.as_str()? {
        "" => None,
        queue => Some(queue.to_string()),
    }
}

/// Key namespace shared by every component of one client.
///
/// A non-empty prefix always ends with `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Creates a key space, appending the `:` separator if missing.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with(':') {
            prefix.push(':');
        }
        Self { prefix }
    }

    /// The normalized prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefixes an arbitrary key.
    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Strips the prefix from a fully qualified key.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }

    /// List holding a live queue.
    pub fn queue(&self, name: &str) -> String {
        format!("{}queue:{}", self.prefix, name)
    }

    /// Set of known queue names.
    pub fn queues(&self) -> String {
        self.key("queues")
    }

    /// Sorted index of delayed timestamps.
    pub fn delayed_schedule(&self) -> String {
        self.key("delayed_queue_schedule")
    }

    /// List of payloads delayed until `timestamp`.
    pub fn delayed(&self, timestamp: i64) -> String {
        format!("{}delayed:{}", self.prefix, timestamp)
    }

    /// Status record of a job.
    pub fn status(&self, job_prefix: &str, id: &str) -> String {
        format!("{}job:{}{}:status", self.prefix, job_prefix, id)
    }

    /// List of failure records.
    pub fn failed(&self) -> String {
        self.key("failed")
    }

    /// Named counter.
    pub fn stat(&self, name: &str) -> String {
        format!("{}stat:{}", self.prefix, name)
    }

    /// Set of registered worker ids.
    pub fn workers(&self) -> String {
        self.key("workers")
    }

    /// "Working on" marker of a worker.
    pub fn worker(&self, id: &str) -> String {
        format!("{}worker:{}", self.prefix, id)
    }

    /// Start time of a worker.
    pub fn worker_started(&self, id: &str) -> String {
        format!("{}worker:{}:started", self.prefix, id)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("resque")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_gets_separator() {
        assert_eq!(KeySpace::new("resque").prefix(), "resque:");
        assert_eq!(KeySpace::new("more:than:one:without").prefix(), "more:than:one:without:");
        assert_eq!(KeySpace::new("resque:").prefix(), "resque:");
        assert_eq!(KeySpace::new("").prefix(), "");
    }

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("test");

        assert_eq!(keys.queue("default"), "test:queue:default");
        assert_eq!(keys.delayed(1700000000), "test:delayed:1700000000");
        assert_eq!(keys.delayed_schedule(), "test:delayed_queue_schedule");
        assert_eq!(keys.status("", "abc"), "test:job:abc:status");
        assert_eq!(keys.status("app1_", "abc"), "test:job:app1_abc:status");
        assert_eq!(keys.stat("failed:w1"), "test:stat:failed:w1");
        assert_eq!(keys.worker_started("w1"), "test:worker:w1:started");
    }

    #[test]
    fn test_delayed_route() {
        assert_eq!(delayed_route(r#"{"class":"C","queue":"jobs"}"#).as_deref(), Some("jobs"));
        assert_eq!(delayed_route(r#"{"class":"C"}"#), None);
        assert_eq!(delayed_route(r#"{"class":"C","queue":""}"#), None);
        assert_eq!(delayed_route(r#"{"class":"C","queue":7}"#), None);
        assert_eq!(delayed_route("not json"), None);
    }

    #[test]
    fn test_strip() {
        let keys = KeySpace::new("test");
        assert_eq!(keys.strip("test:queue:jobs"), Some("queue:jobs"));
        assert_eq!(keys.strip("other:queue:jobs"), None);
    }
}
