//! Named counters kept in the store (`stat:<name>`).

use crate::client::Resque;
use crate::error::JobResult;

/// Counter access for one client.
#[derive(Clone)]
pub struct Stat {
    client: Resque,
}

impl Stat {
    /// Creates a counter accessor.
    pub fn new(client: &Resque) -> Self {
        Self { client: client.clone() }
    }

    /// Current value, 0 if never set.
    pub async fn get(&self, name: &str) -> JobResult<i64> {
        let raw = self.client.store().get(&self.client.keys().stat(name)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Increments by one.
    pub async fn incr(&self, name: &str) -> JobResult<i64> {
        self.incr_by(name, 1).await
    }

    /// Increments by `by`.
    pub async fn incr_by(&self, name: &str, by: i64) -> JobResult<i64> {
        self.client.store().incr_by(&self.client.keys().stat(name), by).await
    }

    /// Decrements by one.
    pub async fn decr(&self, name: &str) -> JobResult<i64> {
        self.incr_by(name, -1).await
    }

    /// Deletes the counter.
    pub async fn clear(&self, name: &str) -> JobResult<bool> {
        self.client.store().delete(&self.client.keys().stat(name)).await
    }
}
