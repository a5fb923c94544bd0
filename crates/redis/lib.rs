//! Redis store for mbj job enqueueing.
//!
//! This crate provides the Redis implementation of [`mbj_core::Store`]: the
//! sorted sets backing unique-job locks and the schedule, and the lists
//! backing Sidekiq queues.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mbj_core::{Client, Config};
//! use mbj_redis::RedisStore;
//!
//! #[tokio::main]
//! async fn main() -> mbj_core::Result<()> {
//!     let config = Config::builder().namespace("myapp").strict(false).build()?;
//!     let store = RedisStore::from_config(&config).await?;
//!     let client = Client::builder()
//!         .config(config)
//!         .store(store)
//!         .sidekiq()
//!         .unique_jobs()
//!         .build()?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use mbj_core::{Config, MbjError, Result, Store};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

fn backend_error(e: RedisError) -> MbjError {
    MbjError::Backend(e.to_string())
}

/// Redis store.
///
/// Commands share one multiplexed [`ConnectionManager`]; a semaphore caps how
/// many run at once and callers wait at most `pool_timeout` for a slot.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    permits: Arc<Semaphore>,
    pool_size: usize,
    pool_timeout: Duration,
}

impl RedisStore {
    /// Connect with default pool settings.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let defaults = Config::default();
        Self::connect(redis_url, defaults.pool_size, defaults.pool_timeout).await
    }

    /// Connect using the URL and pool settings of `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::connect(&config.redis_url, config.pool_size, config.pool_timeout).await
    }

    /// Connect with explicit pool settings.
    pub async fn connect(redis_url: &str, pool_size: usize, pool_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(backend_error)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_error)?;
        debug!(pool_size, ?pool_timeout, "Connected to Redis");
        Ok(Self::with_connection(conn, pool_size, pool_timeout))
    }

    /// Create a store over an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, pool_size: usize, pool_timeout: Duration) -> Self {
        Self {
            conn,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            pool_size: pool_size.max(1),
            pool_timeout,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn pool_timeout(&self) -> Duration {
        self.pool_timeout
    }

    /// Number of free connection slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot and hand out a connection.
    async fn checkout(&self) -> Result<(SemaphorePermit<'_>, ConnectionManager)> {
        let permit = tokio::time::timeout(self.pool_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                MbjError::Timeout(format!(
                    "Waited {:?} for one of {} Redis connections",
                    self.pool_timeout, self.pool_size
                ))
            })?
            .map_err(|e| MbjError::Backend(e.to_string()))?;
        Ok((permit, self.conn.clone()))
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool_size", &self.pool_size)
            .field("pool_timeout", &self.pool_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let (_permit, mut conn) = self.checkout().await?;
        let added: usize = conn.zadd(key, member, score).await.map_err(backend_error)?;
        Ok(added > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let (_permit, mut conn) = self.checkout().await?;
        conn.zscore(key, member).await.map_err(backend_error)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let (_permit, mut conn) = self.checkout().await?;
        let removed: usize = conn.zrem(key, member).await.map_err(backend_error)?;
        Ok(removed > 0)
    }

    async fn zrem_below(&self, key: &str, bound: f64) -> Result<usize> {
        let (_permit, mut conn) = self.checkout().await?;
        conn.zrembyscore(key, "-inf", format!("({}", bound))
            .await
            .map_err(backend_error)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        let (_permit, mut conn) = self.checkout().await?;
        conn.zcount(key, min, max).await.map_err(backend_error)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let (_permit, mut conn) = self.checkout().await?;
        conn.zcard(key).await.map_err(backend_error)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let (_permit, mut conn) = self.checkout().await?;
        conn.zrangebyscore(key, min, max).await.map_err(backend_error)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        let (_permit, mut conn) = self.checkout().await?;
        conn.lpush(key, value).await.map_err(backend_error)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let (_permit, mut conn) = self.checkout().await?;
        conn.llen(key).await.map_err(backend_error)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        let (_permit, mut conn) = self.checkout().await?;
        conn.lrange(key, 0, -1).await.map_err(backend_error)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let (_permit, mut conn) = self.checkout().await?;
        let removed: usize = conn.del(key).await.map_err(backend_error)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use mbj_core::testing::ManualClock;
    use mbj_core::{Client, Lock, LockScope, UniqueJob, UnlockPolicy, WorkerDefinition};
    use serde_json::{json, Value};

    const NOW: f64 = 1_593_642_280.0;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn test_namespace() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("mbj_test_{}", ts)
    }

    async fn store() -> RedisStore {
        RedisStore::new(&redis_url())
            .await
            .expect("Failed to connect to Redis")
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_sorted_set_commands() {
        let store = store().await;
        let key = format!("{}:zset", test_namespace());

        assert!(store.zadd(&key, "a", 10.0).await.unwrap());
        assert!(store.zadd(&key, "b", 20.0).await.unwrap());
        assert!(!store.zadd(&key, "a", 15.0).await.unwrap());
        assert_eq!(store.zscore(&key, "a").await.unwrap(), Some(15.0));
        assert_eq!(store.zscore(&key, "missing").await.unwrap(), None);

        assert_eq!(store.zcount(&key, 0.0, 15.0).await.unwrap(), 1);
        assert_eq!(store.zrange_by_score(&key, 0.0, 100.0).await.unwrap(), vec!["a", "b"]);

        // Exclusive upper bound.
        assert_eq!(store.zrem_below(&key, 20.0).await.unwrap(), 1);
        assert_eq!(store.zcard(&key).await.unwrap(), 1);

        assert!(store.zrem(&key, "b").await.unwrap());
        assert!(!store.zrem(&key, "b").await.unwrap());
        assert!(!store.del(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_list_commands() {
        let store = store().await;
        let key = format!("{}:queue:default", test_namespace());

        assert_eq!(store.lpush(&key, "first").await.unwrap(), 1);
        assert_eq!(store.lpush(&key, "second").await.unwrap(), 2);
        assert_eq!(store.llen(&key).await.unwrap(), 2);
        assert_eq!(store.lrange(&key).await.unwrap(), vec!["second", "first"]);
        assert!(store.del(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_lock_lifecycle() {
        let store = store().await;
        let digest = format!("{}:uniqueness:sidekiq:default", test_namespace());
        let lock = Lock::new(digest.as_str(), "abc", NOW + 60.0);

        assert!(!lock.locked(&store, NOW).await.unwrap());
        assert!(lock.lock(&store).await.unwrap());
        assert!(lock.locked(&store, NOW).await.unwrap());
        assert!(!lock.locked(&store, NOW + 61.0).await.unwrap());
        assert_eq!(store.zcard(&digest).await.unwrap(), 0);

        lock.lock(&store).await.unwrap();
        assert!(lock.unlock(&store).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_client_deduplicates_sidekiq_pushes() {
        let namespace = test_namespace();
        let store = store().await;
        let clock = ManualClock::new(NOW);
        let config = Config::builder()
            .namespace(namespace.as_str())
            .redis_url(redis_url())
            .worker(
                "DummyWorker",
                WorkerDefinition::new()
                    .uniq(UniqueJob::new(LockScope::Queue, 3600, UnlockPolicy::Success)),
            )
            .build()
            .unwrap();
        let client = Client::builder()
            .config(config)
            .store(store.clone())
            .clock(clock.clone())
            .sidekiq()
            .unique_jobs()
            .build()
            .unwrap();

        let worker = || client.worker("DummyWorker").unwrap().with_args(vec![json!(1)]);
        let queue = format!("{}:queue:default", namespace);

        let payload = client.push(worker(), Some("sidekiq")).await.unwrap().unwrap();
        assert!(client.push(worker(), Some("sidekiq")).await.unwrap().is_none());
        assert_eq!(store.llen(&queue).await.unwrap(), 1);

        let stored: Value = serde_json::from_str(&store.lrange(&queue).await.unwrap()[0]).unwrap();
        assert_eq!(stored, Value::Object(payload));

        clock.advance(3601.0);
        assert!(client.push(worker(), Some("sidekiq")).await.unwrap().is_some());
        assert_eq!(store.llen(&queue).await.unwrap(), 2);

        store.del(&queue).await.unwrap();
        store
            .del(&format!("{}:uniqueness:sidekiq:default", namespace))
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_pool_timeout() {
        let store = RedisStore::connect(&redis_url(), 1, Duration::from_millis(50))
            .await
            .expect("Failed to connect to Redis");

        let _held = store.permits.acquire().await.unwrap();
        assert_eq!(store.available(), 0);
        assert!(matches!(
            store.zcard("anything").await,
            Err(MbjError::Timeout(_))
        ));
    }
}
