//! TTL-scored locks stored as sorted-set members.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;
use crate::store::Store;
use crate::unique_job::UniqueJob;

/// One claim inside a digest's sorted set.
///
/// `lock_id` is the member and `ttl` (absolute epoch seconds) the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub digest: String,
    pub lock_id: String,
    pub ttl: f64,
}

impl Lock {
    pub fn new(digest: impl Into<String>, lock_id: impl Into<String>, ttl: f64) -> Self {
        Self {
            digest: digest.into(),
            lock_id: lock_id.into(),
            ttl,
        }
    }

    /// Stable identity of a job: lower-hex SHA-256 of the compact JSON
    /// `[class, args]`.
    pub fn lock_id_for(class: &str, args: &[Value]) -> String {
        let identity = Value::Array(vec![
            Value::String(class.to_string()),
            Value::Array(args.to_vec()),
        ]);
        hex::encode(Sha256::digest(identity.to_string().as_bytes()))
    }

    /// Rebuild a lock from its JSON form.
    ///
    /// Returns `None` unless `digest`, `lock_id` and `ttl` are all present.
    pub fn coerce(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let digest = map.get("digest")?.as_str()?;
        let lock_id = map.get("lock_id")?.as_str()?;
        let ttl = match map.get("ttl")? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Some(Self::new(digest, lock_id, ttl))
    }

    pub fn as_json(&self) -> Value {
        serde_json::json!({
            "digest": self.digest,
            "lock_id": self.lock_id,
            "ttl": self.ttl,
        })
    }

    /// Write the member with its ttl as score.
    ///
    /// This always overwrites the score of an existing member. Returns `true`
    /// when the member was new and `false` when it was only re-scored.
    pub async fn lock(&self, store: &dyn Store) -> Result<bool> {
        let created = store.zadd(&self.digest, &self.lock_id, self.ttl).await?;
        debug!(digest = %self.digest, lock_id = %self.lock_id, ttl = self.ttl, created, "Lock written");
        Ok(created)
    }

    /// Whether this member exists and has not expired at `now`.
    ///
    /// Expired members of the whole set are purged on every call.
    pub async fn locked(&self, store: &dyn Store, now: f64) -> Result<bool> {
        let locked = store
            .zscore(&self.digest, &self.lock_id)
            .await?
            .is_some_and(|expires_at| expires_at >= now);
        Self::flush_expired_members(store, &self.digest, now).await?;
        Ok(locked)
    }

    /// Remove the member. Returns whether it was present.
    pub async fn unlock(&self, store: &dyn Store) -> Result<bool> {
        let removed = store.zrem(&self.digest, &self.lock_id).await?;
        debug!(digest = %self.digest, lock_id = %self.lock_id, removed, "Lock released");
        Ok(removed)
    }

    /// Remove every member of `digest` that expired before `now`.
    pub async fn flush_expired_members(store: &dyn Store, digest: &str, now: f64) -> Result<usize> {
        let removed = store.zrem_below(digest, now).await?;
        if removed > 0 {
            debug!(digest, removed, "Flushed expired locks");
        }
        Ok(removed)
    }

    /// Drop the whole lock set.
    pub async fn flush(store: &dyn Store, digest: &str) -> Result<bool> {
        store.del(digest).await
    }

    /// Count members of `digest` whose expiry falls within `[from, to]`.
    ///
    /// The window defaults to `[0, now + one week]`.
    pub async fn count(
        store: &dyn Store,
        digest: &str,
        from: Option<f64>,
        to: Option<f64>,
        now: f64,
    ) -> Result<usize> {
        let from = from.unwrap_or(0.0);
        let to = to.unwrap_or(now + UniqueJob::DEFAULT_TIMEOUT as f64);
        store.zcount(digest, from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use serde_json::json;

    const NOW: f64 = 1_593_642_280.0;
    const DIGEST: &str = "multi-bg-test:uniqueness:sidekiq:default";

    #[test]
    fn test_lock_id_is_deterministic() {
        let a = Lock::lock_id_for("DummyWorker", &[json!("User"), json!(1)]);
        let b = Lock::lock_id_for("DummyWorker", &[json!("User"), json!(1)]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert_ne!(a, Lock::lock_id_for("DummyWorker", &[json!("User"), json!(2)]));
        assert_ne!(a, Lock::lock_id_for("OtherWorker", &[json!("User"), json!(1)]));
    }

    #[test]
    fn test_lock_id_matches_sha256_of_compact_json() {
        let expected = hex::encode(Sha256::digest(br#"["DummyWorker",["User",1]]"#));
        assert_eq!(
            Lock::lock_id_for("DummyWorker", &[json!("User"), json!(1)]),
            expected
        );
    }

    #[test]
    fn test_coerce() {
        assert_eq!(Lock::coerce(&Value::Null), None);
        assert_eq!(Lock::coerce(&json!({})), None);
        assert_eq!(Lock::coerce(&json!({"digest": "d", "lock_id": "l"})), None);
        assert_eq!(
            Lock::coerce(&json!({"digest": "d", "lock_id": "l", "ttl": null})),
            None
        );
        assert_eq!(
            Lock::coerce(&json!({"digest": "d", "lock_id": "l", "ttl": 10})),
            Some(Lock::new("d", "l", 10.0))
        );
    }

    #[test]
    fn test_as_json() {
        let lock = Lock::new("d", "l", 10.5);
        assert_eq!(lock.as_json(), json!({"digest": "d", "lock_id": "l", "ttl": 10.5}));
        assert_eq!(Lock::coerce(&lock.as_json()), Some(lock));
    }

    #[tokio::test]
    async fn test_lock_reports_creation_and_overwrites() {
        let store = MemoryStore::new();
        let lock = Lock::new(DIGEST, "abc", NOW + 10.0);

        assert!(lock.lock(&store).await.unwrap());
        assert_eq!(store.zscore(DIGEST, "abc").await.unwrap(), Some(NOW + 10.0));

        let renewed = Lock::new(DIGEST, "abc", NOW + 20.0);
        assert!(!renewed.lock(&store).await.unwrap());
        assert_eq!(store.zscore(DIGEST, "abc").await.unwrap(), Some(NOW + 20.0));
    }

    #[tokio::test]
    async fn test_locked_lifecycle() {
        let store = MemoryStore::new();
        let lock = Lock::new(DIGEST, "abc", NOW + 10.0);

        assert!(!lock.locked(&store, NOW).await.unwrap());

        lock.lock(&store).await.unwrap();
        assert!(lock.locked(&store, NOW).await.unwrap());
        assert!(lock.locked(&store, NOW + 10.0).await.unwrap());
        assert!(!lock.locked(&store, NOW + 10.5).await.unwrap());
        assert_eq!(store.zcard(DIGEST).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_locked_purges_other_expired_members() {
        let store = MemoryStore::new();
        store.zadd(DIGEST, "expired", NOW - 1.0).await.unwrap();
        store.zadd(DIGEST, "active", NOW + 100.0).await.unwrap();

        let absent = Lock::new(DIGEST, "absent", NOW + 10.0);
        assert!(!absent.locked(&store, NOW).await.unwrap());
        assert_eq!(store.zscore(DIGEST, "expired").await.unwrap(), None);
        assert_eq!(store.zscore(DIGEST, "active").await.unwrap(), Some(NOW + 100.0));
    }

    #[tokio::test]
    async fn test_unlock() {
        let store = MemoryStore::new();
        let lock = Lock::new(DIGEST, "abc", NOW + 10.0);

        assert!(!lock.unlock(&store).await.unwrap());
        lock.lock(&store).await.unwrap();
        assert!(lock.unlock(&store).await.unwrap());
        assert!(!lock.locked(&store, NOW).await.unwrap());
    }

    #[tokio::test]
    async fn test_flush_expired_members() {
        let store = MemoryStore::new();
        store.zadd(DIGEST, "a", NOW - 2.0).await.unwrap();
        store.zadd(DIGEST, "b", NOW - 1.0).await.unwrap();
        store.zadd(DIGEST, "c", NOW).await.unwrap();

        assert_eq!(Lock::flush_expired_members(&store, DIGEST, NOW).await.unwrap(), 2);
        assert_eq!(store.zcard(DIGEST).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_and_count() {
        let store = MemoryStore::new();
        store.zadd(DIGEST, "a", NOW + 10.0).await.unwrap();
        store.zadd(DIGEST, "b", NOW + 20.0).await.unwrap();
        store.zadd(DIGEST, "far", NOW + 2.0 * UniqueJob::DEFAULT_TIMEOUT as f64).await.unwrap();

        assert_eq!(Lock::count(&store, DIGEST, None, None, NOW).await.unwrap(), 2);
        assert_eq!(
            Lock::count(&store, DIGEST, Some(NOW + 15.0), None, NOW).await.unwrap(),
            1
        );
        assert_eq!(
            Lock::count(&store, DIGEST, None, Some(f64::INFINITY), NOW).await.unwrap(),
            3
        );

        assert!(Lock::flush(&store, DIGEST).await.unwrap());
        assert_eq!(Lock::count(&store, DIGEST, None, None, NOW).await.unwrap(), 0);
        assert!(!Lock::flush(&store, DIGEST).await.unwrap());
    }
}
