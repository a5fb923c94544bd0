//! Job description types shared by workers and adapters.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::{MbjError, Result};
use crate::unique_job::UniqueJob;

/// The wire form of a job as written by an adapter.
pub type Payload = Map<String, Value>;

/// Generate a job id: 24 lower-case hex characters.
pub fn generate_jid() -> String {
    let mut jid = Uuid::new_v4().simple().to_string();
    jid.truncate(24);
    jid
}

/// Retry setting of a job: a flag or an attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Retry {
    Enabled(bool),
    Count(i64),
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Enabled(true)
    }
}

impl From<bool> for Retry {
    fn from(enabled: bool) -> Self {
        Retry::Enabled(enabled)
    }
}

impl From<i64> for Retry {
    fn from(count: i64) -> Self {
        Retry::Count(count)
    }
}

impl From<i32> for Retry {
    fn from(count: i32) -> Self {
        Retry::Count(count.into())
    }
}

impl Retry {
    /// Read a retry value out of a raw payload.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(enabled) => Some(Retry::Enabled(*enabled)),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(Retry::Count),
            _ => None,
        }
    }
}

/// Options for routing a job.
///
/// Every field is optional so that per-class defaults and caller options can
/// be layered with [`JobOptions::merge_defaults`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Target queue. Adapters fall back to `"default"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,
    /// Backend used when a push does not name one.
    #[serde(default, alias = "service", skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the retry setting.
    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    /// Set the default backend.
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Fill every unset field from `defaults`.
    pub fn merge_defaults(mut self, defaults: &JobOptions) -> Self {
        if self.queue.is_none() {
            self.queue = defaults.queue.clone();
        }
        if self.retry.is_none() {
            self.retry = defaults.retry;
        }
        if self.backend.is_none() {
            self.backend = defaults.backend.clone();
        }
        self
    }

    /// The queue name, `"default"` when unset.
    pub fn queue_or_default(&self) -> &str {
        self.queue.as_deref().unwrap_or("default")
    }
}

/// Job data accumulated by a worker before an adapter shapes it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
    /// Absolute epoch seconds the job is scheduled for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
    /// Uniqueness metadata, filled in when a lock is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniq: Option<UniqueJob>,
}

impl JobPayload {
    /// Arguments, empty when none were given.
    pub fn args(&self) -> &[Value] {
        self.args.as_deref().unwrap_or(&[])
    }

    /// Write every present field into `target`.
    ///
    /// Fields the backend does not support are left to the caller.
    pub fn write_into(&self, target: &mut Payload) -> Result<()> {
        if let Value::Object(fields) = serde_json::to_value(self)? {
            target.extend(fields);
        }
        target
            .entry("args".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        Ok(())
    }
}

/// The accepted representations of a point in time.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeValue {
    /// Seconds since the Unix epoch.
    Epoch(f64),
    /// An ISO-8601 / RFC3339 string. A missing offset means UTC.
    Text(String),
    DateTime(DateTime<Utc>),
}

impl TimeValue {
    /// Interpret a JSON number or string. Anything else is rejected.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(TimeValue::Epoch)
                .ok_or_else(|| MbjError::InvalidTimestamp(value.to_string())),
            Value::String(s) => Ok(TimeValue::Text(s.clone())),
            other => Err(MbjError::InvalidTimestamp(other.to_string())),
        }
    }

    /// Normalize to epoch seconds.
    pub fn to_epoch(&self) -> Result<f64> {
        match self {
            TimeValue::Epoch(secs) if secs.is_finite() => Ok(*secs),
            TimeValue::Epoch(secs) => Err(MbjError::InvalidTimestamp(secs.to_string())),
            TimeValue::Text(text) => parse_time_text(text).map(|dt| epoch_seconds(&dt)),
            TimeValue::DateTime(dt) => Ok(epoch_seconds(dt)),
        }
    }
}

impl From<f64> for TimeValue {
    fn from(secs: f64) -> Self {
        TimeValue::Epoch(secs)
    }
}

impl From<i64> for TimeValue {
    fn from(secs: i64) -> Self {
        TimeValue::Epoch(secs as f64)
    }
}

impl From<&str> for TimeValue {
    fn from(text: &str) -> Self {
        TimeValue::Text(text.to_string())
    }
}

impl From<String> for TimeValue {
    fn from(text: String) -> Self {
        TimeValue::Text(text)
    }
}

impl From<DateTime<Utc>> for TimeValue {
    fn from(dt: DateTime<Utc>) -> Self {
        TimeValue::DateTime(dt)
    }
}

impl From<SystemTime> for TimeValue {
    fn from(time: SystemTime) -> Self {
        TimeValue::DateTime(time.into())
    }
}

fn parse_time_text(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| MbjError::InvalidTimestamp(text.to_string()))
}

fn epoch_seconds(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

/// Format epoch seconds as RFC3339 with nine fractional digits.
pub fn rfc3339_nanos(epoch: f64) -> Result<String> {
    let secs = epoch.floor();
    let nanos = ((epoch - secs) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .ok_or_else(|| MbjError::InvalidTimestamp(epoch.to_string()))
}
