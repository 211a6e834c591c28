//! In-process implementation of [`Store`].
//!
//! Holds everything behind one mutex, so each trait method is trivially
//! atomic. Used by the test suites and by embedded single-process setups.

use super::{delayed_route, Promotion, Store};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    Sorted(HashMap<String, i64>),
}

#[derive(Debug, Default)]
struct Data {
    entries: HashMap<String, Entry>,
    expiry: HashMap<String, Instant>,
}

impl Data {
    fn purge_if_expired(&mut self, key: &str) {
        if self.expiry.get(key).is_some_and(|at| *at <= Instant::now()) {
            self.expiry.remove(key);
            self.entries.remove(key);
        }
    }

    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        self.purge_if_expired(key);
        self.expiry.remove(key);
        self.entries.remove(key)
    }

    fn list(&mut self, key: &str) -> JobResult<Option<&mut VecDeque<String>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::List(list)) => Ok(Some(list)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_or_create(&mut self, key: &str) -> JobResult<&mut VecDeque<String>> {
        self.purge_if_expired(key);
        match self.entries.entry(key.to_string()).or_insert_with(|| Entry::List(VecDeque::new())) {
            Entry::List(list) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }

    fn set(&mut self, key: &str) -> JobResult<Option<&mut BTreeSet<String>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::Set(set)) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_or_create(&mut self, key: &str) -> JobResult<&mut BTreeSet<String>> {
        self.purge_if_expired(key);
        match self.entries.entry(key.to_string()).or_insert_with(|| Entry::Set(BTreeSet::new())) {
            Entry::Set(set) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted(&mut self, key: &str) -> JobResult<Option<&mut HashMap<String, i64>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::Sorted(sorted)) => Ok(Some(sorted)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Pops the head of a list, dropping the key once it is empty.
    fn pop_front(&mut self, key: &str) -> JobResult<Option<String>> {
        let Some(list) = self.list(key)? else {
            return Ok(None);
        };
        let value = list.pop_front();
        if list.is_empty() {
            self.remove(key);
        }
        Ok(value)
    }

    fn remove_from_sorted(&mut self, key: &str, member: &str) -> JobResult<bool> {
        let Some(sorted) = self.sorted(key)? else {
            return Ok(false);
        };
        let removed = sorted.remove(member).is_some();
        if sorted.is_empty() {
            self.remove(key);
        }
        Ok(removed)
    }

    fn write_string(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(key.to_string(), Entry::Str(value.to_string()));
        match ttl {
            Some(ttl) => {
                self.expiry.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                self.expiry.remove(key);
            }
        }
    }
}

fn len_u64(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

fn wrong_type(key: &str) -> JobError {
    JobError::Store(format!("WRONGTYPE operation against key '{key}' holding the wrong kind of value"))
}

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<Data>,
    pushed: Notify,
}

/// In-memory store.
///
/// Clones and [`Store::reconnect`] handles share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop_any(&self, keys: &[String]) -> JobResult<Option<(String, String)>> {
        let mut data = self.shared.data.lock();
        for key in keys {
            if let Some(value) = data.pop_front(key)? {
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, key: &str, value: &str) -> JobResult<u64> {
        let len = {
            let mut data = self.shared.data.lock();
            let list = data.list_or_create(key)?;
            list.push_back(value.to_string());
            len_u64(list.len())
        };
        self.shared.pushed.notify_waiters();
        Ok(len)
    }

    async fn pop(&self, key: &str) -> JobResult<Option<String>> {
        self.shared.data.lock().pop_front(key)
    }

    async fn blocking_pop(&self, keys: &[String], timeout: Duration) -> JobResult<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.try_pop_any(keys)? {
                return Ok(Some(popped));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop_any(keys);
            }
        }
    }

    async fn list_len(&self, key: &str) -> JobResult<u64> {
        Ok(self.shared.data.lock().list(key)?.map_or(0, |l| len_u64(l.len())))
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> JobResult<Vec<String>> {
        let mut data = self.shared.data.lock();
        let Some(list) = data.list(key)? else {
            return Ok(Vec::new());
        };

        let len = isize::try_from(list.len()).unwrap_or(isize::MAX);
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        // Both bounds are non-negative here.
        let skip = usize::try_from(start).unwrap_or_default();
        let take = usize::try_from(stop - start + 1).unwrap_or_default();
        Ok(list.iter().skip(skip).take(take).cloned().collect())
    }

    async fn list_remove(&self, key: &str, value: &str) -> JobResult<u64> {
        let mut data = self.shared.data.lock();
        let Some(list) = data.list(key)? else {
            return Ok(0);
        };
        let Some(pos) = list.iter().position(|v| v == value) else {
            return Ok(0);
        };
        list.remove(pos);
        if list.is_empty() {
            data.remove(key);
        }
        Ok(1)
    }

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> JobResult<()> {
        let mut data = self.shared.data.lock();
        data.purge_if_expired(key);
        match data
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Sorted(HashMap::new()))
        {
            Entry::Sorted(sorted) => {
                sorted.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn sorted_range_by_score(&self, key: &str, max: i64, limit: Option<usize>) -> JobResult<Vec<String>> {
        let mut data = self.shared.data.lock();
        let Some(sorted) = data.sorted(key)? else {
            return Ok(Vec::new());
        };

        let mut members: Vec<(&String, &i64)> = sorted.iter().filter(|(_, score)| **score <= max).collect();
        members.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));

        Ok(members
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> JobResult<bool> {
        self.shared.data.lock().remove_from_sorted(key, member)
    }

    async fn sorted_card(&self, key: &str) -> JobResult<u64> {
        Ok(self.shared.data.lock().sorted(key)?.map_or(0, |s| len_u64(s.len())))
    }

    async fn promote_delayed(
        &self,
        list: &str,
        index: &str,
        member: &str,
        queues: &str,
        queue_prefix: &str,
    ) -> JobResult<Promotion> {
        let promotion = {
            let mut data = self.shared.data.lock();
            let items: Vec<String> = match data.list(list)? {
                Some(items) => items.iter().cloned().collect(),
                None => Vec::new(),
            };

            // Check every destination before the first write so a type
            // conflict leaves the schedule untouched.
            let routes: Vec<Option<String>> = items.iter().map(|raw| delayed_route(raw)).collect();
            for queue in routes.iter().flatten() {
                let key = format!("{queue_prefix}{queue}");
                if !matches!(data.entry(&key), None | Some(Entry::List(_))) {
                    return Err(wrong_type(&key));
                }
            }
            if !matches!(data.entry(queues), None | Some(Entry::Set(_))) {
                return Err(wrong_type(queues));
            }
            data.sorted(index)?;

            let mut promotion = Promotion::default();
            for (raw, route) in items.into_iter().zip(routes) {
                let Some(queue) = route else {
                    promotion.rejected.push(raw);
                    continue;
                };
                data.list_or_create(&format!("{queue_prefix}{queue}"))?.push_back(raw.clone());
                data.set_or_create(queues)?.insert(queue);
                promotion.moved.push(raw);
            }
            data.remove(list);
            data.remove_from_sorted(index, member)?;
            promotion
        };

        if !promotion.moved.is_empty() {
            self.shared.pushed.notify_waiters();
        }
        Ok(promotion)
    }

    async fn unindex_if_empty(&self, list: &str, index: &str, member: &str) -> JobResult<bool> {
        let mut data = self.shared.data.lock();
        if data.list(list)?.is_some_and(|l| !l.is_empty()) {
            return Ok(false);
        }
        data.remove(list);
        data.remove_from_sorted(index, member)
    }

    async fn get(&self, key: &str) -> JobResult<Option<String>> {
        match self.shared.data.lock().entry(key) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<()> {
        self.shared.data.lock().write_string(key, value, ttl);
        Ok(())
    }

    async fn replace(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<bool> {
        let mut data = self.shared.data.lock();
        if data.entry(key).is_none() {
            return Ok(false);
        }
        data.write_string(key, value, ttl);
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> JobResult<Option<Duration>> {
        let mut data = self.shared.data.lock();
        if data.entry(key).is_none() {
            return Ok(None);
        }
        Ok(data
            .expiry
            .get(key)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn delete(&self, key: &str) -> JobResult<bool> {
        Ok(self.shared.data.lock().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> JobResult<bool> {
        Ok(self.shared.data.lock().entry(key).is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> JobResult<i64> {
        let mut data = self.shared.data.lock();
        let current = match data.entry(key) {
            None => 0,
            Some(Entry::Str(value)) => value
                .parse::<i64>()
                .map_err(|_| JobError::Store(format!("value at '{key}' is not an integer")))?,
            Some(_) => return Err(wrong_type(key)),
        };
        let next = current + delta;
        data.entries.insert(key.to_string(), Entry::Str(next.to_string()));
        Ok(next)
    }

    async fn set_add(&self, key: &str, member: &str) -> JobResult<bool> {
        Ok(self.shared.data.lock().set_or_create(key)?.insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut data = self.shared.data.lock();
        let Some(set) = data.set(key)? else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> JobResult<Vec<String>> {
        Ok(self
            .shared
            .data
            .lock()
            .set(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: &str) -> JobResult<bool> {
        Ok(self.shared.data.lock().set(key)?.is_some_and(|s| s.contains(member)))
    }

    async fn keys_by_prefix(&self, prefix: &str) -> JobResult<Vec<String>> {
        let mut data = self.shared.data.lock();
        let now = Instant::now();
        let expired: Vec<String> = data
            .expiry
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            data.remove(&key);
        }

        let mut keys: Vec<String> = data.entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn reconnect(&self) -> JobResult<Arc<dyn Store>> {
        Ok(Arc::new(self.clone()))
    }

    async fn ping(&self) -> JobResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_fifo() {
        let store = MemoryStore::new();
        store.push("q", "a").await.unwrap();
        store.push("q", "b").await.unwrap();
        assert_eq!(store.list_len("q").await.unwrap(), 2);
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop("q").await.unwrap(), None);
        assert!(!store.exists("q").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_range_bounds() {
        let store = MemoryStore::new();
        for v in ["a", "b", "c", "d"] {
            store.push("q", v).await.unwrap();
        }
        assert_eq!(store.list_range("q", 0, -1).await.unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(store.list_range("q", 1, 2).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.list_range("q", -2, -1).await.unwrap(), vec!["c", "d"]);
        assert_eq!(store.list_range("q", 2, 100).await.unwrap(), vec!["c", "d"]);
        assert!(store.list_range("q", 5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocking_pop_respects_key_order() {
        let store = MemoryStore::new();
        store.push("low", "l").await.unwrap();
        store.push("high", "h").await.unwrap();

        let keys = vec!["high".to_string(), "low".to_string()];
        let popped = store.blocking_pop(&keys, Duration::from_millis(10)).await.unwrap();
        assert_eq!(popped, Some(("high".to_string(), "h".to_string())));
    }

    #[tokio::test]
    async fn test_blocking_pop_times_out() {
        let store = MemoryStore::new();
        let keys = vec!["empty".to_string()];
        let popped = store.blocking_pop(&keys, Duration::from_millis(20)).await.unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let store = MemoryStore::new();
        let pusher = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push("q", "late").await.unwrap();
        });

        let keys = vec!["q".to_string()];
        let popped = store.blocking_pop(&keys, Duration::from_secs(5)).await.unwrap();
        assert_eq!(popped, Some(("q".to_string(), "late".to_string())));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_promote_delayed_moves_payloads() {
        let store = MemoryStore::new();
        let good_a = r#"{"class":"A","queue":"jobs"}"#;
        let good_b = r#"{"class":"B","queue":"mail"}"#;
        let broken = r#"{"class":"C"}"#;
        for raw in [good_a, broken, good_b] {
            store.push("delayed:10", raw).await.unwrap();
        }
        store.push("queue:jobs", "already-there").await.unwrap();
        store.sorted_add("schedule", 10, "10").await.unwrap();

        let promotion = store
            .promote_delayed("delayed:10", "schedule", "10", "queues", "queue:")
            .await
            .unwrap();

        assert_eq!(promotion.moved, vec![good_a, good_b]);
        assert_eq!(promotion.rejected, vec![broken]);
        assert_eq!(store.list_range("queue:jobs", 0, -1).await.unwrap(), vec!["already-there", good_a]);
        assert_eq!(store.list_range("queue:mail", 0, -1).await.unwrap(), vec![good_b]);
        assert_eq!(store.set_members("queues").await.unwrap(), vec!["jobs", "mail"]);
        assert!(!store.exists("delayed:10").await.unwrap());
        assert_eq!(store.sorted_card("schedule").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_promote_delayed_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.push("delayed:10", r#"{"class":"A","queue":"jobs"}"#).await.unwrap();
        store.push("delayed:10", r#"{"class":"B","queue":"blocked"}"#).await.unwrap();
        store.sorted_add("schedule", 10, "10").await.unwrap();
        store.set("queue:blocked", "not a list", None).await.unwrap();

        let result = store
            .promote_delayed("delayed:10", "schedule", "10", "queues", "queue:")
            .await;

        assert!(matches!(result, Err(JobError::Store(_))));
        assert_eq!(store.list_len("delayed:10").await.unwrap(), 2);
        assert_eq!(store.sorted_card("schedule").await.unwrap(), 1);
        assert_eq!(store.list_len("queue:jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unindex_if_empty_keeps_non_empty() {
        let store = MemoryStore::new();
        store.push("delayed:10", "a").await.unwrap();
        store.sorted_add("schedule", 10, "10").await.unwrap();
        assert!(!store.unindex_if_empty("delayed:10", "schedule", "10").await.unwrap());
        assert_eq!(store.sorted_card("schedule").await.unwrap(), 1);

        store.list_remove("delayed:10", "a").await.unwrap();
        assert!(store.unindex_if_empty("delayed:10", "schedule", "10").await.unwrap());
        assert_eq!(store.sorted_card("schedule").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sorted_range_by_score() {
        let store = MemoryStore::new();
        store.sorted_add("z", 30, "30").await.unwrap();
        store.sorted_add("z", 10, "10").await.unwrap();
        store.sorted_add("z", 20, "20").await.unwrap();

        assert_eq!(store.sorted_range_by_score("z", 25, None).await.unwrap(), vec!["10", "20"]);
        assert_eq!(store.sorted_range_by_score("z", 100, Some(1)).await.unwrap(), vec!["10"]);
        assert!(store.sorted_range_by_score("z", 5, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_only_existing() {
        let store = MemoryStore::new();
        assert!(!store.replace("k", "v", None).await.unwrap());
        assert!(!store.exists("k").await.unwrap());

        store.set("k", "v1", None).await.unwrap();
        assert!(store.replace("k", "v2", Some(Duration::from_secs(60))).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(store.ttl("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_keys_vanish() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_millis(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.keys_by_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incr_and_wrong_type() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("n", 1).await.unwrap(), 1);
        assert_eq!(store.incr_by("n", 5).await.unwrap(), 6);
        assert_eq!(store.incr_by("n", -2).await.unwrap(), 4);

        store.push("list", "x").await.unwrap();
        assert!(matches!(store.incr_by("list", 1).await, Err(JobError::Store(_))));
    }

    #[tokio::test]
    async fn test_reconnect_shares_data() {
        let store = MemoryStore::new();
        let other = store.reconnect().await.unwrap();
        other.push("q", "x").await.unwrap();
        assert_eq!(store.list_len("q").await.unwrap(), 1);
    }
}
