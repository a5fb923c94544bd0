//! Deduplication of unique jobs on push.
//!
//! Before a unique job is written, its lock is looked up in the digest set for
//! the backend (and queue, unless the policy is systemwide). A live lock vetoes
//! the push. Otherwise the lock metadata is embedded in the payload under
//! `uniq` and the lock is written before the backend write happens.
//!
//! The check and the write are two separate store commands, so two concurrent
//! duplicates can both get through.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::lock::Lock;
use crate::lock_digest::LockDigest;
use crate::middleware::{Middleware, Next, PushResult};
use crate::store::{SharedStore, Store};
use crate::unique_job::UniqueJob;
use crate::worker::Worker;

/// Middleware enforcing [`UniqueJob`] policies.
#[derive(Debug, Clone)]
pub struct UniqueJobMiddleware {
    store: SharedStore,
    namespace: Option<String>,
}

impl UniqueJobMiddleware {
    pub fn new(store: SharedStore, namespace: Option<String>) -> Self {
        Self { store, namespace }
    }
}

/// The lock a unique worker claims when pushed to `backend`.
///
/// Returns `None` for workers without a uniqueness policy. The ttl is taken
/// from the worker's clock.
pub fn unique_job_lock(namespace: Option<&str>, worker: &Worker, backend: &str) -> Option<Lock> {
    let unique_job = worker.unique_job()?;
    let digest = LockDigest::new(
        namespace,
        [backend, worker.options().queue_or_default()],
        unique_job.across(),
    );
    Some(Lock::new(
        digest.to_string(),
        Lock::lock_id_for(worker.worker_class(), worker.payload().args()),
        unique_job.ttl(worker.now()),
    ))
}

/// Release the lock recorded in a raw job payload.
///
/// Consumers call this when a job starts or succeeds, depending on its unlock
/// policy. Returns `Ok(None)` when the payload carries no lock.
pub async fn release_unique_lock(store: &dyn Store, payload: &Value) -> Result<Option<bool>> {
    let Some(uniq) = payload.get("uniq") else {
        return Ok(None);
    };
    match UniqueJob::coerce(uniq)?.and_then(|u| u.lock().cloned()) {
        Some(lock) => lock.unlock(store).await.map(Some),
        None => Ok(None),
    }
}

#[async_trait]
impl Middleware for UniqueJobMiddleware {
    async fn call(&self, mut worker: Worker, backend: &str, next: Next<'_>) -> PushResult {
        let Some(lock) = unique_job_lock(self.namespace.as_deref(), &worker, backend) else {
            return next.run(worker).await;
        };

        if lock.locked(&self.store, worker.now()).await? {
            info!(
                class = worker.worker_class(),
                backend,
                digest = %lock.digest,
                "Skipping duplicate unique job"
            );
            return Ok(None);
        }

        if let Some(unique_job) = worker.unique_job_mut() {
            unique_job.set_lock(lock.clone());
        }
        worker.payload_mut().uniq = worker.unique_job().cloned();
        lock.lock(&self.store).await?;
        debug!(class = worker.worker_class(), backend, digest = %lock.digest, "Unique lock acquired");

        next.run(worker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Payload;
    use crate::middleware::{BoxFuture, MiddlewareChain};
    use crate::testing::{ManualClock, MemoryStore};
    use crate::unique_job::{LockScope, UnlockPolicy};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    const NOW: f64 = 1_593_642_280.0;

    fn setup() -> (MemoryStore, MiddlewareChain) {
        let store = MemoryStore::new();
        let shared = SharedStore::new(store.clone());
        let mut chain = MiddlewareChain::new();
        chain.add(move || UniqueJobMiddleware::new(shared.clone(), Some("multi-bg-test".to_string())));
        (store, chain)
    }

    fn worker(clock: &ManualClock) -> Worker {
        Worker::new("DummyWorker")
            .with_clock(Arc::new(clock.clone()))
            .with_args(vec![json!("User"), json!(1)])
    }

    type Seen = Arc<Mutex<Vec<Worker>>>;

    fn terminal(seen: Seen) -> impl FnOnce(Worker) -> BoxFuture<'static, PushResult> + Send {
        move |worker: Worker| -> BoxFuture<'static, PushResult> {
            Box::pin(async move {
                seen.lock().unwrap().push(worker);
                Ok(Some(Payload::new()))
            })
        }
    }

    #[tokio::test]
    async fn test_passes_through_without_policy() {
        let (store, chain) = setup();
        let clock = ManualClock::new(NOW);
        let seen: Seen = Arc::default();

        let result = chain
            .invoke(worker(&clock), "sidekiq", terminal(seen.clone()))
            .await
            .unwrap();

        assert!(result.is_some());
        assert_eq!(seen.lock().unwrap()[0].payload().uniq, None);
        assert_eq!(
            store.zcard("multi-bg-test:uniqueness:sidekiq:default").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_locks_and_embeds_metadata() {
        let (store, chain) = setup();
        let clock = ManualClock::new(NOW);
        let seen: Seen = Arc::default();
        let policy = UniqueJob::new(LockScope::Queue, 3600, UnlockPolicy::Success);

        chain
            .invoke(worker(&clock).unique(policy), "sidekiq", terminal(seen.clone()))
            .await
            .unwrap();

        let lock_id = Lock::lock_id_for("DummyWorker", &[json!("User"), json!(1)]);
        let digest = "multi-bg-test:uniqueness:sidekiq:default";
        assert_eq!(store.zscore(digest, &lock_id).await.unwrap(), Some(NOW + 3600.0));

        let pushed = seen.lock().unwrap()[0].clone();
        let uniq = pushed.payload().uniq.clone().unwrap();
        assert_eq!(
            uniq.as_json(),
            json!({
                "across": "queue",
                "timeout": 3600,
                "unlock_policy": "success",
                "lock": {"digest": digest, "lock_id": lock_id, "ttl": NOW + 3600.0},
            })
        );
        assert_eq!(pushed.unique_job().and_then(|u| u.lock()), uniq.lock());
    }

    #[tokio::test]
    async fn test_vetoes_while_locked() {
        let (store, chain) = setup();
        let clock = ManualClock::new(NOW);
        let seen: Seen = Arc::default();
        let policy = UniqueJob::new(LockScope::Queue, 3600, UnlockPolicy::Success);

        for _ in 0..2 {
            chain
                .invoke(worker(&clock).unique(policy.clone()), "sidekiq", terminal(seen.clone()))
                .await
                .unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 1);

        clock.advance(3601.0);
        let result = chain
            .invoke(worker(&clock).unique(policy), "sidekiq", terminal(seen.clone()))
            .await
            .unwrap();
        assert!(result.is_some());
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(
            store.zcard("multi-bg-test:uniqueness:sidekiq:default").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_queue_scope_allows_other_queues() {
        let (_store, chain) = setup();
        let clock = ManualClock::new(NOW);
        let seen: Seen = Arc::default();

        chain
            .invoke(worker(&clock).unique(true).queue("a"), "sidekiq", terminal(seen.clone()))
            .await
            .unwrap();
        chain
            .invoke(worker(&clock).unique(true).queue("b"), "sidekiq", terminal(seen.clone()))
            .await
            .unwrap();
        chain
            .invoke(worker(&clock).unique(true).queue("a"), "faktory", terminal(seen.clone()))
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_systemwide_scope_spans_queues() {
        let (store, chain) = setup();
        let clock = ManualClock::new(NOW);
        let seen: Seen = Arc::default();
        let policy = UniqueJob::new(LockScope::Systemwide, 60, UnlockPolicy::Start);

        chain
            .invoke(worker(&clock).unique(policy.clone()).queue("a"), "sidekiq", terminal(seen.clone()))
            .await
            .unwrap();
        let result = chain
            .invoke(worker(&clock).unique(policy).queue("b"), "sidekiq", terminal(seen.clone()))
            .await
            .unwrap();

        assert_eq!(result, None);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(store.zcard("multi-bg-test:uniqueness:sidekiq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_unique_lock() {
        let store = MemoryStore::new();
        let lock = Lock::new("digest", "abc", NOW + 10.0);
        lock.lock(&store).await.unwrap();

        let payload = json!({
            "class": "DummyWorker",
            "uniq": {"across": "queue", "timeout": 10, "unlock_policy": "start", "lock": lock.as_json()},
        });
        assert_eq!(release_unique_lock(&store, &payload).await.unwrap(), Some(true));
        assert_eq!(release_unique_lock(&store, &payload).await.unwrap(), Some(false));

        assert_eq!(
            release_unique_lock(&store, &json!({"class": "DummyWorker"})).await.unwrap(),
            None
        );
        assert_eq!(
            release_unique_lock(&store, &json!({"uniq": {"across": "queue"}})).await.unwrap(),
            None
        );
    }

    #[test]
    fn test_unique_job_lock_digest_without_queue() {
        let clock = ManualClock::new(NOW);
        let lock = unique_job_lock(None, &worker(&clock).unique(true), "Sidekiq").unwrap();
        assert_eq!(lock.digest, "uniqueness:sidekiq:default");
        assert_eq!(lock.ttl, NOW + UniqueJob::DEFAULT_TIMEOUT as f64);

        assert!(unique_job_lock(None, &worker(&clock), "sidekiq").is_none());
    }
}
