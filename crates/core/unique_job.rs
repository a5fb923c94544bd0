//! Deduplication policy for unique jobs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{MbjError, Result};
use crate::lock::Lock;

/// Whether a uniqueness claim applies within one queue or the whole backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    /// Duplicates are only detected within the job's queue.
    #[default]
    Queue,
    /// Duplicates are detected across every queue of the backend.
    Systemwide,
}

impl LockScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockScope::Queue => "queue",
            LockScope::Systemwide => "systemwide",
        }
    }
}

impl FromStr for LockScope {
    type Err = MbjError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queue" => Ok(LockScope::Queue),
            "systemwide" => Ok(LockScope::Systemwide),
            other => Err(MbjError::InvalidLockScope(other.to_string())),
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the execution side releases a uniqueness claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlockPolicy {
    /// Keep the lock until the job has run successfully, including retries.
    #[default]
    Success,
    /// Release the lock right before the job starts executing.
    Start,
}

impl UnlockPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockPolicy::Success => "success",
            UnlockPolicy::Start => "start",
        }
    }
}

impl FromStr for UnlockPolicy {
    type Err = MbjError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(UnlockPolicy::Success),
            "start" => Ok(UnlockPolicy::Start),
            other => Err(MbjError::InvalidUnlockPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for UnlockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated uniqueness policy, optionally carrying the lock issued for it.
///
/// The timeout bounds how long a lock may live so that a lost job can never
/// block its duplicates forever. It defaults to one week.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawUniqueJob")]
pub struct UniqueJob {
    across: LockScope,
    timeout: i64,
    unlock_policy: UnlockPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock: Option<Lock>,
}

impl UniqueJob {
    /// One week, in seconds.
    pub const DEFAULT_TIMEOUT: i64 = 604_800;

    /// Create a policy. A timeout of zero or less falls back to the default.
    pub fn new(across: LockScope, timeout: i64, unlock_policy: UnlockPolicy) -> Self {
        Self {
            across,
            timeout: normalize_timeout(timeout),
            unlock_policy,
            lock: None,
        }
    }

    /// Create a policy from unvalidated scope and unlock policy names.
    pub fn parse(across: &str, timeout: i64, unlock_policy: &str) -> Result<Self> {
        Ok(Self::new(across.parse()?, timeout, unlock_policy.parse()?))
    }

    /// Build a policy from loosely typed JSON.
    ///
    /// `null`, booleans, strings and other non-objects yield `None`; an object
    /// is validated field by field, with missing fields taking defaults.
    pub fn coerce(value: &Value) -> Result<Option<Self>> {
        if !value.is_object() {
            return Ok(None);
        }
        let raw: RawUniqueJob = serde_json::from_value(value.clone())?;
        Self::try_from(raw).map(Some)
    }

    pub fn across(&self) -> LockScope {
        self.across
    }

    /// Lock lifetime in seconds.
    pub fn timeout(&self) -> i64 {
        self.timeout
    }

    pub fn unlock_policy(&self) -> UnlockPolicy {
        self.unlock_policy
    }

    /// The lock acquired for this job, once the push went through.
    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    /// Attach an issued lock.
    pub fn with_lock(mut self, lock: Lock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub(crate) fn set_lock(&mut self, lock: Lock) {
        self.lock = Some(lock);
    }

    /// Absolute expiry for a lock acquired at `now`.
    pub fn ttl(&self, now: f64) -> f64 {
        now + self.timeout as f64
    }

    /// The JSON form embedded under the payload's `uniq` key.
    pub fn as_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("across".to_string(), self.across.as_str().into());
        map.insert("timeout".to_string(), self.timeout.into());
        map.insert("unlock_policy".to_string(), self.unlock_policy.as_str().into());
        if let Some(lock) = &self.lock {
            map.insert("lock".to_string(), lock.as_json());
        }
        Value::Object(map)
    }
}

impl Default for UniqueJob {
    fn default() -> Self {
        Self::new(LockScope::default(), Self::DEFAULT_TIMEOUT, UnlockPolicy::default())
    }
}

impl PartialEq for UniqueJob {
    fn eq(&self, other: &Self) -> bool {
        self.across == other.across
            && self.timeout == other.timeout
            && self.unlock_policy == other.unlock_policy
    }
}

fn normalize_timeout(timeout: i64) -> i64 {
    if timeout <= 0 {
        UniqueJob::DEFAULT_TIMEOUT
    } else {
        timeout
    }
}

/// Wire shape accepted for `uniq`, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUniqueJob {
    across: Option<Value>,
    timeout: Option<Value>,
    unlock_policy: Option<Value>,
    lock: Option<Value>,
}

impl TryFrom<RawUniqueJob> for UniqueJob {
    type Error = MbjError;

    fn try_from(raw: RawUniqueJob) -> Result<Self> {
        let across = match raw.across {
            None | Some(Value::Null) => LockScope::default(),
            Some(Value::String(s)) => s.parse()?,
            Some(other) => return Err(MbjError::InvalidLockScope(other.to_string())),
        };
        let unlock_policy = match raw.unlock_policy {
            None | Some(Value::Null) => UnlockPolicy::default(),
            Some(Value::String(s)) => s.parse()?,
            Some(other) => return Err(MbjError::InvalidUnlockPolicy(other.to_string())),
        };
        let timeout = match raw.timeout {
            Some(Value::Number(n)) => n.as_f64().map(|f| f.trunc() as i64).unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f.trunc() as i64).unwrap_or(0),
            _ => 0,
        };

        let mut unique_job = UniqueJob::new(across, timeout, unlock_policy);
        unique_job.lock = raw.lock.as_ref().and_then(Lock::coerce);
        Ok(unique_job)
    }
}

/// The accepted forms of a uniqueness setting.
///
/// `false` clears the policy, `true` installs the default one and a policy
/// installs itself. Deserializes from a boolean or a policy object.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(from = "UniqueSettingRepr")]
pub enum UniqueSetting {
    #[default]
    Disabled,
    Default,
    Policy(UniqueJob),
}

impl UniqueSetting {
    /// Read a setting from loosely typed JSON.
    ///
    /// Booleans map to `Default`/`Disabled`, an object is validated as a
    /// policy and anything else disables uniqueness.
    pub fn coerce(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(enabled) => Ok((*enabled).into()),
            other => UniqueJob::coerce(other).map(Self::from),
        }
    }

    /// The policy this setting resolves to.
    pub fn resolve(self) -> Option<UniqueJob> {
        match self {
            UniqueSetting::Disabled => None,
            UniqueSetting::Default => Some(UniqueJob::default()),
            UniqueSetting::Policy(unique_job) => Some(unique_job),
        }
    }
}

impl From<bool> for UniqueSetting {
    fn from(enabled: bool) -> Self {
        if enabled {
            UniqueSetting::Default
        } else {
            UniqueSetting::Disabled
        }
    }
}

impl From<UniqueJob> for UniqueSetting {
    fn from(unique_job: UniqueJob) -> Self {
        UniqueSetting::Policy(unique_job)
    }
}

impl From<Option<UniqueJob>> for UniqueSetting {
    fn from(unique_job: Option<UniqueJob>) -> Self {
        unique_job.map(UniqueSetting::Policy).unwrap_or_default()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UniqueSettingRepr {
    Flag(bool),
    Policy(UniqueJob),
}

impl From<UniqueSettingRepr> for UniqueSetting {
    fn from(repr: UniqueSettingRepr) -> Self {
        match repr {
            UniqueSettingRepr::Flag(enabled) => enabled.into(),
            UniqueSettingRepr::Policy(unique_job) => unique_job.into(),
        }
    }
}
