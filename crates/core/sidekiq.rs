//! Redis-list wire format compatible with Sidekiq.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::adapter::{coerce_payload, Adapter};
use crate::clock::SharedClock;
use crate::error::Result;
use crate::job::{JobOptions, Payload};
use crate::middleware::PushResult;
use crate::store::{SharedStore, Store};
use crate::unique_job_middleware::unique_job_lock;
use crate::worker::Worker;

/// Builds namespaced keys for queue structures.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    namespace: Option<String>,
}

impl QueueKeys {
    pub fn new(namespace: Option<String>) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn key(&self, suffix: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, suffix),
            None => suffix.to_string(),
        }
    }

    /// Key for the scheduled jobs sorted set (ZSET, scored by run time).
    pub fn schedule(&self) -> String {
        self.key("schedule")
    }

    /// Key for an immediate-dispatch queue (LIST).
    pub fn queue(&self, name: &str) -> String {
        self.key(&format!("queue:{}", name))
    }
}

/// Adapter writing Sidekiq job hashes into Redis structures.
///
/// Immediate jobs are pushed onto `<ns>:queue:<queue>`; jobs scheduled in the
/// future go to the `<ns>:schedule` sorted set, scored by their run time.
#[derive(Debug, Clone)]
pub struct SidekiqAdapter {
    store: SharedStore,
    keys: QueueKeys,
    clock: SharedClock,
}

impl SidekiqAdapter {
    /// Backend key this adapter is registered under by default.
    pub const BACKEND: &'static str = "sidekiq";

    pub fn new(store: SharedStore, namespace: Option<String>, clock: SharedClock) -> Self {
        Self {
            store,
            keys: QueueKeys::new(namespace),
            clock,
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Number of jobs waiting in `queue`.
    pub async fn queue_len(&self, queue: &str) -> Result<usize> {
        self.store.llen(&self.keys.queue(queue)).await
    }

    /// Number of scheduled jobs.
    pub async fn schedule_len(&self) -> Result<usize> {
        self.store.zcard(&self.keys.schedule()).await
    }

    /// The job hash for `worker`, with `at` still present when set.
    fn build_payload(worker: &Worker, now: f64) -> Result<Payload> {
        let mut payload = Payload::new();
        worker.payload().write_into(&mut payload)?;
        payload.insert("class".to_string(), worker.worker_class().into());
        payload.insert(
            "retry".to_string(),
            serde_json::to_value(worker.options().retry.unwrap_or_default())?,
        );
        payload.insert("queue".to_string(), worker.options().queue_or_default().into());
        payload.entry("created_at".to_string()).or_insert_with(|| now.into());
        Ok(payload)
    }
}

#[async_trait]
impl Adapter for SidekiqAdapter {
    async fn push(&self, worker: Worker) -> PushResult {
        let now = worker.now();
        let queue = worker.options().queue_or_default();
        let mut payload = Self::build_payload(&worker, now)?;
        payload.insert("enqueued_at".to_string(), now.into());

        let at = payload.remove("at").as_ref().and_then(Value::as_f64);
        let json = serde_json::to_string(&payload)?;

        match at {
            Some(at) if at > now => {
                self.store.zadd(&self.keys.schedule(), &json, at).await?;
                debug!(
                    class = worker.worker_class(),
                    jid = ?worker.payload().jid,
                    at,
                    "Scheduled job"
                );
            }
            _ => {
                self.store.lpush(&self.keys.queue(queue), &json).await?;
                debug!(
                    class = worker.worker_class(),
                    jid = ?worker.payload().jid,
                    queue,
                    "Enqueued job"
                );
            }
        }

        Ok(Some(payload))
    }

    async fn acknowledge(&self, worker: &Worker, backend: &str) -> Result<Option<bool>> {
        let Some(unique_job) = worker.unique_job() else {
            return Ok(None);
        };
        let lock = match unique_job.lock() {
            Some(lock) => lock.clone(),
            None => match unique_job_lock(self.keys.namespace(), worker, backend) {
                Some(lock) => lock,
                None => return Ok(None),
            },
        };
        lock.unlock(&self.store).await.map(Some)
    }

    fn coerce_to_worker(&self, payload: &Value, options: JobOptions) -> Result<Worker> {
        coerce_payload(payload, "class", options, &self.clock)
    }
}
