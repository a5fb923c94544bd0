//! Job description builder.

use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::client::Client;
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;
use crate::job::{generate_jid, JobOptions, JobPayload, Retry, TimeValue};
use crate::middleware::PushResult;
use crate::unique_job::{UniqueJob, UniqueSetting};

/// A job description built up before it is pushed to a backend.
///
/// Workers are cheap values created per enqueue attempt. Only the payload an
/// adapter derives from them is ever persisted.
///
/// # Example
///
/// ```rust,ignore
/// let payload = client
///     .worker("UserWorker")?
///     .with_args(vec![json!(1)])
///     .schedule_in(Duration::from_secs(600))
///     .push(&client, Some("sidekiq"))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Worker {
    worker_class: String,
    options: JobOptions,
    payload: JobPayload,
    unique_job: Option<UniqueJob>,
    clock: SharedClock,
}

impl Worker {
    /// Create a worker for `worker_class` with empty options.
    pub fn new(worker_class: impl Into<String>) -> Self {
        Self {
            worker_class: worker_class.into(),
            options: JobOptions::default(),
            payload: JobPayload::default(),
            unique_job: None,
            clock: system_clock(),
        }
    }

    /// Replace the routing options.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.options.retry = Some(retry.into());
        self
    }

    /// Backend used when `push` is called without one.
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.options.backend = Some(backend.into());
        self
    }

    /// Replace the job arguments.
    pub fn with_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.payload.args = Some(args.into_iter().collect());
        self
    }

    /// Attach free-form custom data.
    pub fn with_custom(mut self, custom: Map<String, Value>) -> Self {
        self.payload.custom = Some(custom);
        self
    }

    pub fn created_at(mut self, value: impl Into<TimeValue>) -> Result<Self> {
        self.payload.created_at = Some(value.into().to_epoch()?);
        Ok(self)
    }

    pub fn enqueued_at(mut self, value: impl Into<TimeValue>) -> Result<Self> {
        self.payload.enqueued_at = Some(value.into().to_epoch()?);
        Ok(self)
    }

    /// Schedule the job for an absolute time.
    ///
    /// A time at or before now leaves the worker untouched, so the job is
    /// dispatched immediately.
    pub fn at(self, value: impl Into<TimeValue>) -> Result<Self> {
        let timestamp = value.into().to_epoch()?;
        Ok(self.schedule(timestamp))
    }

    /// Schedule the job `delay` from now. A zero delay is a no-op.
    pub fn schedule_in(self, delay: Duration) -> Self {
        let timestamp = self.now() + delay.as_secs_f64();
        self.schedule(timestamp)
    }

    fn schedule(mut self, timestamp: f64) -> Self {
        let now = self.now();
        if timestamp <= now {
            return self;
        }
        self.payload.at = Some(timestamp);
        self.payload.created_at = Some(now);
        self
    }

    /// Set or clear the uniqueness policy.
    ///
    /// Accepts `bool`, [`UniqueJob`], `Option<UniqueJob>` or a
    /// [`UniqueSetting`].
    pub fn unique(mut self, setting: impl Into<UniqueSetting>) -> Self {
        self.unique_job = setting.into().resolve();
        self
    }

    /// Assign a job id unless one is already set.
    ///
    /// Generates a random id when `jid` is `None`.
    pub fn with_job_jid(mut self, jid: Option<String>) -> Self {
        if self.payload.jid.is_none() {
            self.payload.jid = Some(jid.unwrap_or_else(generate_jid));
        }
        self
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn worker_class(&self) -> &str {
        &self.worker_class
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut JobPayload {
        &mut self.payload
    }

    pub fn unique_job(&self) -> Option<&UniqueJob> {
        self.unique_job.as_ref()
    }

    pub fn unique_job_mut(&mut self) -> Option<&mut UniqueJob> {
        self.unique_job.as_mut()
    }

    pub fn is_unique(&self) -> bool {
        self.unique_job.is_some()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Current time according to this worker's clock.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Push through `client` to `backend`, or to the worker's default backend.
    ///
    /// Returns `Ok(None)` when a middleware vetoed the push.
    pub async fn push(self, client: &Client, backend: Option<&str>) -> PushResult {
        client.push(self, backend).await
    }

    /// Release this job's uniqueness lock outside the execution path.
    pub async fn acknowledge(&self, client: &Client, backend: Option<&str>) -> Result<Option<bool>> {
        client.acknowledge(self, backend).await
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        self.worker_class == other.worker_class
            && self.options == other.options
            && self.payload == other.payload
            && self.unique_job == other.unique_job
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("worker_class", &self.worker_class)
            .field("options", &self.options)
            .field("payload", &self.payload)
            .field("unique_job", &self.unique_job)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MbjError;
    use crate::testing::ManualClock;
    use crate::unique_job::{LockScope, UnlockPolicy};
    use serde_json::json;
    use std::sync::Arc;

    const NOW: f64 = 1_593_642_280.0;

    fn worker() -> Worker {
        Worker::new("DummyWorker").with_clock(Arc::new(ManualClock::new(NOW)))
    }

    #[test]
    fn test_new_worker_is_empty() {
        let worker = Worker::new("DummyWorker");
        assert_eq!(worker.worker_class(), "DummyWorker");
        assert_eq!(worker.options(), &JobOptions::default());
        assert_eq!(worker.payload(), &JobPayload::default());
        assert!(!worker.is_unique());
    }

    #[test]
    fn test_with_args_replaces() {
        let worker = worker()
            .with_args(vec![json!(1)])
            .with_args(vec![json!("User"), json!(2)]);
        assert_eq!(worker.payload().args(), &[json!("User"), json!(2)]);
    }

    #[test]
    fn test_options_setters() {
        let worker = worker().queue("mailer").retry(false).backend("faktory");
        assert_eq!(
            worker.options(),
            &JobOptions::new().queue("mailer").retry(false).backend("faktory")
        );
    }

    #[test]
    fn test_created_and_enqueued_at() {
        let worker = worker()
            .created_at(NOW - 10.0)
            .unwrap()
            .enqueued_at("2020-07-01T22:24:40Z")
            .unwrap();
        assert_eq!(worker.payload().created_at, Some(NOW - 10.0));
        assert_eq!(worker.payload().enqueued_at, Some(NOW));

        assert!(matches!(
            worker.created_at("not a date"),
            Err(MbjError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_at_in_the_past_is_noop() {
        let worker = worker().at(NOW - 1.0).unwrap();
        assert_eq!(worker.payload(), &JobPayload::default());

        let worker = worker.at(NOW).unwrap();
        assert_eq!(worker.payload().at, None);
        assert_eq!(worker.payload().created_at, None);
    }

    #[test]
    fn test_at_in_the_future() {
        let worker = worker().at(NOW + 60.0).unwrap();
        assert_eq!(worker.payload().at, Some(NOW + 60.0));
        assert_eq!(worker.payload().created_at, Some(NOW));
    }

    #[test]
    fn test_schedule_in() {
        let worker = worker().schedule_in(Duration::from_secs(600));
        assert_eq!(worker.payload().at, Some(NOW + 600.0));
        assert_eq!(worker.payload().created_at, Some(NOW));

        let worker = super::tests::worker().schedule_in(Duration::ZERO);
        assert_eq!(worker.payload().at, None);
    }

    #[test]
    fn test_unique_settings() {
        let worker = worker().unique(true);
        assert_eq!(worker.unique_job(), Some(&UniqueJob::default()));

        let policy = UniqueJob::new(LockScope::Systemwide, 3600, UnlockPolicy::Start);
        let worker = worker.unique(policy.clone());
        assert_eq!(worker.unique_job(), Some(&policy));

        let worker = worker.unique(false);
        assert!(!worker.is_unique());

        let worker = worker.unique(Some(policy.clone())).unique(None::<UniqueJob>);
        assert!(!worker.is_unique());
    }

    #[test]
    fn test_with_job_jid_does_not_overwrite() {
        let worker = worker().with_job_jid(Some("abc".to_string()));
        assert_eq!(worker.payload().jid.as_deref(), Some("abc"));

        let worker = worker.with_job_jid(Some("def".to_string())).with_job_jid(None);
        assert_eq!(worker.payload().jid.as_deref(), Some("abc"));
    }

    #[test]
    fn test_with_job_jid_generates() {
        let worker = worker().with_job_jid(None);
        let jid = worker.payload().jid.clone().unwrap();
        assert_eq!(jid.len(), 24);
    }

    #[test]
    fn test_equality_is_structural() {
        let a = worker().with_args(vec![json!(1)]).queue("mailer");
        let b = Worker::new("DummyWorker").with_args(vec![json!(1)]).queue("mailer");
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with_args(vec![json!(2)]));
        assert_ne!(a, b.clone().unique(true));
        assert_ne!(a, b.queue("default"));
    }

    #[test]
    fn test_debug_omits_clock() {
        let debug = format!("{:?}", worker());
        assert!(debug.contains("DummyWorker"));
        assert!(!debug.contains("ManualClock"));
    }
}
