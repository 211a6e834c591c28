//! Redis implementation of [`Store`].

use super::{Promotion, Store};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};
use resque_config::RedisConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Routes every payload of a delayed list onto its live queue, then drops the
/// list and its index entry. Destinations are type-checked before the first
/// write, since a script is not rolled back when a command fails.
///
/// KEYS: delayed list, schedule index, queue name set.
/// ARGV: index member, live queue key prefix.
const PROMOTE_SCRIPT: &str = r"
local kind = redis.call('TYPE', KEYS[3]).ok
if kind ~= 'set' and kind ~= 'none' then
  return redis.error_reply('WRONGTYPE ' .. KEYS[3] .. ' is not a set')
end
kind = redis.call('TYPE', KEYS[2]).ok
if kind ~= 'zset' and kind ~= 'none' then
  return redis.error_reply('WRONGTYPE ' .. KEYS[2] .. ' is not a sorted set')
end
local items = redis.call('LRANGE', KEYS[1], 0, -1)
local routes = {}
for i, raw in ipairs(items) do
  local ok, job = pcall(cjson.decode, raw)
  if ok and type(job) == 'table' and type(job.queue) == 'string' and job.queue ~= '' then
    kind = redis.call('TYPE', ARGV[2] .. job.queue).ok
    if kind ~= 'list' and kind ~= 'none' then
      return redis.error_reply('WRONGTYPE ' .. ARGV[2] .. job.queue .. ' is not a list')
    end
    routes[i] = job.queue
  end
end
local moved, rejected = {}, {}
for i, raw in ipairs(items) do
  local queue = routes[i]
  if queue then
    redis.call('SADD', KEYS[3], queue)
    redis.call('RPUSH', ARGV[2] .. queue, raw)
    table.insert(moved, raw)
  else
    table.insert(rejected, raw)
  end
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return {moved, rejected}
";

const UNINDEX_IF_EMPTY_SCRIPT: &str = r"
if redis.call('LLEN', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[1])
  return redis.call('ZREM', KEYS[2], ARGV[1])
end
return 0
";

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!(url = %redact(&config.url), pool_size = config.pool_size, "Creating Redis connection pool...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .create_timeout(Some(config.connect_timeout()))
        .wait_timeout(Some(config.connect_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Hides the password part of a redis url in logs.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

/// Escapes glob metacharacters for `KEYS`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    config: RedisConfig,
    promote: Script,
    unindex: Script,
}

impl RedisStore {
    /// Wraps an existing pool. `config` is kept to open fresh pools on
    /// [`Store::reconnect`].
    pub fn new(pool: Pool, config: RedisConfig) -> Self {
        Self {
            pool,
            config,
            promote: Script::new(PROMOTE_SCRIPT),
            unindex: Script::new(UNINDEX_IF_EMPTY_SCRIPT),
        }
    }

    /// Creates a pool from configuration and wraps it.
    pub async fn connect(config: &RedisConfig) -> JobResult<Self> {
        let pool = create_pool(config).await?;
        Ok(Self::new(pool, config.clone()))
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn push(&self, key: &str, value: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.rpush(key, value).await?)
    }

    async fn pop(&self, key: &str) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("LPOP").arg(key).query_async(&mut *conn).await?)
    }

    async fn blocking_pop(&self, keys: &[String], timeout: Duration) -> JobResult<Option<(String, String)>> {
        if keys.is_empty() {
            return Ok(None);
        }

        let mut conn = self.conn().await?;

        // BLPOP treats 0 as "forever"
        if timeout.is_zero() {
            for key in keys {
                let value: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut *conn).await?;
                if let Some(value) = value {
                    return Ok(Some((key.clone(), value)));
                }
            }
            return Ok(None);
        }

        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(keys)
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(popped)
    }

    async fn list_len(&self, key: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn list_remove(&self, key: &str, value: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.lrem(key, 1, value).await?)
    }

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn sorted_range_by_score(&self, key: &str, max: i64, limit: Option<usize>) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = match limit {
            Some(count) => {
                let count = isize::try_from(count).unwrap_or(isize::MAX);
                conn.zrangebyscore_limit(key, "-inf", max, 0, count).await?
            }
            None => conn.zrangebyscore(key, "-inf", max).await?,
        };
        Ok(members)
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn sorted_card(&self, key: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(key).await?)
    }

    async fn promote_delayed(
        &self,
        list: &str,
        index: &str,
        member: &str,
        queues: &str,
        queue_prefix: &str,
    ) -> JobResult<Promotion> {
        let mut conn = self.conn().await?;
        let (moved, rejected): (Vec<String>, Vec<String>) = self
            .promote
            .key(list)
            .key(index)
            .key(queues)
            .arg(member)
            .arg(queue_prefix)
            .invoke_async(&mut *conn)
            .await?;
        debug!(list = %list, moved = moved.len(), rejected = rejected.len(), "Promoted delayed list");
        Ok(Promotion { moved, rejected })
    }

    async fn unindex_if_empty(&self, list: &str, index: &str, member: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = self
            .unindex
            .key(list)
            .key(index)
            .arg(member)
            .invoke_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn get(&self, key: &str) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn replace(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("XX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let reply: Option<String> = cmd.query_async(&mut *conn).await?;
        Ok(reply.is_some())
    }

    async fn ttl(&self, key: &str) -> JobResult<Option<Duration>> {
        let mut conn = self.conn().await?;
        let secs: i64 = redis::cmd("TTL").arg(key).query_async(&mut *conn).await?;
        Ok(u64::try_from(secs).ok().map(Duration::from_secs))
    }

    async fn delete(&self, key: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> JobResult<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.incr(key, delta).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let added: u64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn set_contains(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.sismember(key, member).await?)
    }

    async fn keys_by_prefix(&self, prefix: &str) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("KEYS").arg(glob_escape(prefix)).query_async(&mut *conn).await?)
    }

    async fn reconnect(&self) -> JobResult<Arc<dyn Store>> {
        let config = RedisConfig {
            pool_size: 1,
            ..self.config.clone()
        };
        let store = RedisStore::connect(&config).await?;
        Ok(Arc::new(store))
    }

    async fn ping(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }
}
