//! Adapter trait shaping workers into backend wire formats.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::error::{MbjError, Result};
use crate::job::{JobOptions, Retry, TimeValue};
use crate::middleware::PushResult;
use crate::unique_job::UniqueSetting;
use crate::worker::Worker;

/// A backend that jobs can be pushed to.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Adapter: Send + Sync + Debug {
    /// Shape `worker` into the backend payload and write it.
    ///
    /// Returns the payload that was written.
    async fn push(&self, worker: Worker) -> PushResult;

    /// Release the worker's uniqueness lock outside the execution path.
    ///
    /// `backend` is the key this adapter is registered under, the same name
    /// the lock digest was built from on push. Returns `Ok(None)` when the
    /// backend does not support it or the worker has no uniqueness policy.
    async fn acknowledge(&self, worker: &Worker, backend: &str) -> Result<Option<bool>>;

    /// Rebuild a worker from a raw payload of this backend.
    ///
    /// `options` set by the caller win over values found in the payload.
    fn coerce_to_worker(&self, payload: &Value, options: JobOptions) -> Result<Worker>;
}

/// A cloneable, type-erased adapter handle.
pub type DynAdapter = Arc<dyn Adapter>;

/// Rebuild a worker from a raw payload whose class name lives in `class_field`.
///
/// Optional fields are applied only when present: `args`, `jid`,
/// `created_at`, `enqueued_at`, `at`, `custom` and `uniq`.
pub(crate) fn coerce_payload(
    payload: &Value,
    class_field: &str,
    mut options: JobOptions,
    clock: &SharedClock,
) -> Result<Worker> {
    let map = payload
        .as_object()
        .ok_or_else(|| MbjError::InvalidPayload("payload must be a JSON object".to_string()))?;
    let class = map
        .get(class_field)
        .and_then(Value::as_str)
        .ok_or_else(|| MbjError::InvalidPayload(format!("missing `{}` string field", class_field)))?;

    if options.retry.is_none() {
        options.retry = map.get("retry").and_then(Retry::from_json);
    }
    if options.queue.is_none() {
        options.queue = map.get("queue").and_then(Value::as_str).map(str::to_string);
    }

    let mut worker = Worker::new(class)
        .with_clock(clock.clone())
        .with_options(options);

    if let Some(args) = map.get("args") {
        worker = worker.with_args(match args {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        });
    }
    if let Some(jid) = map.get("jid").and_then(Value::as_str) {
        worker = worker.with_job_jid(Some(jid.to_string()));
    }
    if let Some(value) = map.get("created_at") {
        worker = worker.created_at(TimeValue::from_json(value)?)?;
    }
    if let Some(value) = map.get("enqueued_at") {
        worker = worker.enqueued_at(TimeValue::from_json(value)?)?;
    }
    if let Some(value) = map.get("at") {
        worker = worker.at(TimeValue::from_json(value)?)?;
    }
    if let Some(Value::Object(custom)) = map.get("custom") {
        worker = worker.with_custom(custom.clone());
    }
    if let Some(value) = map.get("uniq") {
        worker = worker.unique(UniqueSetting::coerce(value)?);
    }
    Ok(worker)
}
