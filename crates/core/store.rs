//! Store abstraction for lock sets and queue structures.
//!
//! Unique-job locks live in sorted sets (member = lock id, score = expiry
//! epoch) and the Redis-list wire format writes into lists and a schedule
//! sorted set. This trait covers exactly the commands those need, so any
//! Redis-compatible store (or the in-memory one used by tests) can back them.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// Store trait for sorted-set and list operations.
///
/// Every method maps to a single atomic store command. Implementations must be
/// thread-safe (Send + Sync).
#[async_trait]
pub trait Store: Send + Sync {
    // ========== Sorted Set Operations ==========

    /// Set the score of `member`, creating it if needed.
    ///
    /// Returns `true` when the member was newly added, `false` when only its
    /// score was updated.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool>;

    /// Get the score of `member`, or `None` when absent.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Remove `member`. Returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove every member whose score is strictly lower than `bound`.
    ///
    /// Returns the number of removed members.
    async fn zrem_below(&self, key: &str, bound: f64) -> Result<usize>;

    /// Count members with `min <= score <= max`.
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<usize>;

    /// Number of members in the sorted set.
    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    // ========== List Operations ==========

    /// Push `value` to the head of the list. Returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> Result<usize>;

    /// Length of the list.
    async fn llen(&self, key: &str) -> Result<usize>;

    /// All list elements, head first.
    async fn lrange(&self, key: &str) -> Result<Vec<String>>;

    // ========== Keys ==========

    /// Delete the whole structure stored at `key`. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;
}

/// A type-erased store that can be shared across threads.
pub type DynStore = Arc<dyn Store>;

/// Wrapper around Arc<dyn Store> for convenience.
#[derive(Clone)]
pub struct SharedStore {
    inner: DynStore,
}

impl SharedStore {
    /// Create a new SharedStore from any Store implementation.
    pub fn new<S: Store + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wrap an already shared store.
    pub fn from_arc(inner: DynStore) -> Self {
        Self { inner }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &DynStore {
        &self.inner
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for SharedStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        self.inner.zadd(key, member, score).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.inner.zscore(key, member).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.zrem(key, member).await
    }

    async fn zrem_below(&self, key: &str, bound: f64) -> Result<usize> {
        self.inner.zrem_below(key, bound).await
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        self.inner.zcount(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.inner.zcard(key).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        self.inner.zrange_by_score(key, min, max).await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        self.inner.lpush(key, value).await
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.inner.llen(key).await
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        self.inner.lrange(key).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.inner.del(key).await
    }
}
