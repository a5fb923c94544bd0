//! Faktory wire format, written through a [`Transport`](crate::Transport).

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::adapter::{coerce_payload, Adapter};
use crate::clock::SharedClock;
use crate::error::{MbjError, Result};
use crate::job::{rfc3339_nanos, JobOptions, Payload, Retry};
use crate::middleware::PushResult;
use crate::transport::DynTransport;
use crate::worker::Worker;

/// Retry attempts Faktory applies when none are given.
pub const DEFAULT_RETRY: i64 = 25;

/// Map a retry setting onto Faktory's integer semantics.
///
/// `false` becomes `-1` (no retries, straight to the dead set) and `true` or
/// no setting becomes the default of 25.
pub fn retry_count(retry: Option<Retry>) -> i64 {
    match retry {
        Some(Retry::Count(count)) => count,
        Some(Retry::Enabled(false)) => -1,
        Some(Retry::Enabled(true)) | None => DEFAULT_RETRY,
    }
}

/// Adapter pushing Faktory job hashes through a transport client.
#[derive(Debug, Clone)]
pub struct FaktoryAdapter {
    transport: Option<DynTransport>,
    clock: SharedClock,
}

impl FaktoryAdapter {
    /// Backend key this adapter is registered under by default.
    pub const BACKEND: &'static str = "faktory";

    /// Create the adapter. Without a transport every push fails with a
    /// configuration error.
    pub fn new(transport: Option<DynTransport>, clock: SharedClock) -> Self {
        Self { transport, clock }
    }

    fn build_payload(worker: &Worker, now: f64) -> Result<Payload> {
        let mut payload = Payload::new();
        worker.payload().write_into(&mut payload)?;
        payload.insert("jobtype".to_string(), worker.worker_class().into());
        payload.insert("queue".to_string(), worker.options().queue_or_default().into());
        payload.insert("retry".to_string(), retry_count(worker.options().retry).into());
        payload.entry("created_at".to_string()).or_insert_with(|| now.into());
        payload.entry("enqueued_at".to_string()).or_insert_with(|| now.into());

        for field in ["created_at", "enqueued_at"] {
            if let Some(epoch) = payload.get(field).and_then(Value::as_f64) {
                payload.insert(field.to_string(), rfc3339_nanos(epoch)?.into());
            }
        }
        match payload.remove("at").as_ref().and_then(Value::as_f64) {
            Some(at) if at > now => {
                payload.insert("at".to_string(), rfc3339_nanos(at)?.into());
            }
            _ => {}
        }
        Ok(payload)
    }
}

#[async_trait]
impl Adapter for FaktoryAdapter {
    async fn push(&self, worker: Worker) -> PushResult {
        let transport = self.transport.as_ref().ok_or_else(|| {
            MbjError::Config("Faktory transport is not configured. Set `faktory_url`".to_string())
        })?;

        let payload = Self::build_payload(&worker, worker.now())?;
        transport.push(&Value::Object(payload.clone())).await?;
        debug!(
            jobtype = worker.worker_class(),
            jid = ?worker.payload().jid,
            queue = worker.options().queue_or_default(),
            scheduled = payload.contains_key("at"),
            "Pushed job to Faktory"
        );
        Ok(Some(payload))
    }

    async fn acknowledge(&self, _worker: &Worker, _backend: &str) -> Result<Option<bool>> {
        Ok(None)
    }

    fn coerce_to_worker(&self, payload: &Value, options: JobOptions) -> Result<Worker> {
        coerce_payload(payload, "jobtype", options, &self.clock)
    }
}
