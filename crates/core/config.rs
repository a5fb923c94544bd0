//! Configuration types for the enqueueing library.
//!
//! `Config` derives `Deserialize` so it can be produced by any loader (YAML,
//! TOML, environment). Every field has a default.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::error::{MbjError, Result};
use crate::job::{JobOptions, Retry};
use crate::unique_job::UniqueSetting;

/// Defaults for one worker class.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct WorkerDefinition {
    #[serde(flatten)]
    pub options: JobOptions,
    /// Uniqueness policy applied to every job of this class.
    #[serde(default)]
    pub uniq: Option<UniqueSetting>,
}

impl WorkerDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.options.retry = Some(retry.into());
        self
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.options.backend = Some(backend.into());
        self
    }

    pub fn uniq(mut self, setting: impl Into<UniqueSetting>) -> Self {
        self.uniq = Some(setting.into());
        self
    }
}

/// Library configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix for every key written to the store.
    pub namespace: Option<String>,
    /// Redis connection URL.
    pub redis_url: String,
    /// Faktory server URL. The Faktory backend is unavailable without it.
    pub faktory_url: Option<String>,
    /// Maximum number of concurrently checked-out connections.
    pub pool_size: usize,
    /// How long to wait for a free connection.
    #[serde(deserialize_with = "duration_secs::deserialize")]
    pub pool_timeout: Duration,
    /// Reject worker classes that have no definition.
    pub strict: bool,
    /// Worker definitions keyed by class name.
    pub workers: HashMap<String, WorkerDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: Some("multi-bg".to_string()),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            faktory_url: None,
            pool_size: 5,
            pool_timeout: Duration::from_secs(5),
            strict: true,
            workers: HashMap::new(),
        }
    }
}

impl Config {
    /// Create a new builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Check pool and connection settings.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(MbjError::Config(format!(
                "The {} for pool_size is not valid. It must be greater than zero",
                self.pool_size
            )));
        }
        if self.pool_timeout.is_zero() {
            return Err(MbjError::Config(format!(
                "The {:?} for pool_timeout is not valid. It must be greater than zero",
                self.pool_timeout
            )));
        }
        check_url("redis_url", &self.redis_url, REDIS_SCHEMES)?;
        if let Some(url) = &self.faktory_url {
            check_url("faktory_url", url, FAKTORY_SCHEMES)?;
        }
        Ok(())
    }

    /// Defaults for `class`.
    ///
    /// In strict mode an unknown class is an error; otherwise it gets an empty
    /// definition.
    pub fn worker_definition(&self, class: &str) -> Result<WorkerDefinition> {
        match self.workers.get(class) {
            Some(definition) => Ok(definition.clone()),
            None if self.strict => Err(MbjError::NotDefinedWorker(class.to_string())),
            None => Ok(WorkerDefinition::default()),
        }
    }
}

const REDIS_SCHEMES: &[&str] = &["redis", "rediss", "redis+unix", "unix"];
const FAKTORY_SCHEMES: &[&str] = &["tcp"];

fn check_url(field: &str, value: &str, schemes: &[&str]) -> Result<()> {
    match Url::parse(value) {
        Ok(url) if schemes.contains(&url.scheme()) => Ok(()),
        Ok(url) => Err(MbjError::Config(format!(
            "The {:?} for {} is not valid. Scheme {:?} must be one of {:?}",
            value,
            field,
            url.scheme(),
            schemes
        ))),
        Err(e) => Err(MbjError::Config(format!(
            "The {:?} for {} is not valid: {}",
            value, field, e
        ))),
    }
}

/// Builder for Config.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = Some(namespace.into());
        self
    }

    /// Write keys without a namespace prefix.
    pub fn no_namespace(mut self) -> Self {
        self.config.namespace = None;
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = url.into();
        self
    }

    pub fn faktory_url(mut self, url: impl Into<String>) -> Self {
        self.config.faktory_url = Some(url.into());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_timeout = timeout;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    /// Register defaults for a worker class.
    pub fn worker(mut self, class: impl Into<String>, definition: WorkerDefinition) -> Self {
        self.config.workers.insert(class.into(), definition);
        self
    }

    /// Validate and build the Config.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serde module reading a Duration from (fractional) seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unique_job::{LockScope, UniqueJob};
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.namespace.as_deref(), Some("multi-bg"));
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.pool_timeout, Duration::from_secs(5));
        assert!(config.strict);
        assert!(config.workers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .namespace("multi-bg-test")
            .pool_size(10)
            .pool_timeout(Duration::from_millis(500))
            .strict(false)
            .faktory_url("tcp://:secret@localhost:7419")
            .worker("DummyWorker", WorkerDefinition::new().queue("mailer").retry(false))
            .build()
            .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("multi-bg-test"));
        assert_eq!(config.pool_size, 10);
        assert!(!config.strict);
        assert_eq!(
            config.workers["DummyWorker"].options,
            JobOptions::new().queue("mailer").retry(false)
        );

        assert_eq!(Config::builder().no_namespace().build().unwrap().namespace, None);
    }

    #[test]
    fn test_invalid_pool_settings() {
        let err = Config::builder().pool_size(0).build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: The 0 for pool_size is not valid. It must be greater than zero"
        );
        assert!(matches!(
            Config::builder().pool_timeout(Duration::ZERO).build(),
            Err(MbjError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_urls() {
        assert!(matches!(
            Config::builder().redis_url("localhost").build(),
            Err(MbjError::Config(_))
        ));
        assert!(matches!(
            Config::builder().faktory_url("localhost:7419").build(),
            Err(MbjError::Config(_))
        ));
        assert!(matches!(
            Config::builder().redis_url("http://localhost:6379").build(),
            Err(MbjError::Config(_))
        ));
        assert!(matches!(
            Config::builder().faktory_url("tcp://localhost:port").build(),
            Err(MbjError::Config(_))
        ));
    }

    #[test]
    fn test_valid_urls() {
        for url in ["redis://127.0.0.1:6379/0", "rediss://:secret@cache.internal", "redis://[::1]:6379"] {
            assert!(Config::builder().redis_url(url).build().is_ok(), "{}", url);
        }
        for url in ["tcp://localhost", "tcp://:secret@[::1]:7419/", "tcp://faktory.internal:7500"] {
            assert!(Config::builder().faktory_url(url).build().is_ok(), "{}", url);
        }
    }

    #[test]
    fn test_worker_definition_strict() {
        let config = Config::builder()
            .worker("DummyWorker", WorkerDefinition::new().queue("mailer"))
            .build()
            .unwrap();

        assert_eq!(
            config.worker_definition("DummyWorker").unwrap().options.queue.as_deref(),
            Some("mailer")
        );
        assert!(matches!(
            config.worker_definition("UnknownWorker"),
            Err(MbjError::NotDefinedWorker(class)) if class == "UnknownWorker"
        ));

        let lenient = Config::builder().strict(false).build().unwrap();
        assert_eq!(
            lenient.worker_definition("UnknownWorker").unwrap(),
            WorkerDefinition::default()
        );
    }

    #[test]
    fn test_deserialize() {
        let config: Config = serde_json::from_value(json!({
            "namespace": "app",
            "pool_timeout": 2.5,
            "workers": {
                "Accounts::ConfirmationEmailWorker": {"retry": false, "queue": "mailer"},
                "Elastic::BatchIndex": {"retry": 5, "queue": "elasticsearch", "backend": "faktory"},
                "UniqueWorker": {"uniq": {"across": "systemwide", "timeout": 60}},
                "AlwaysUnique": {"uniq": true},
            }
        }))
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("app"));
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.pool_timeout, Duration::from_millis(2500));

        let batch = config.worker_definition("Elastic::BatchIndex").unwrap();
        assert_eq!(
            batch.options,
            JobOptions::new().queue("elasticsearch").retry(5).backend("faktory")
        );

        let unique = config.worker_definition("UniqueWorker").unwrap();
        let policy = unique.uniq.and_then(UniqueSetting::resolve).unwrap();
        assert_eq!(policy.across(), LockScope::Systemwide);
        assert_eq!(policy.timeout(), 60);

        let always = config.worker_definition("AlwaysUnique").unwrap();
        assert_eq!(
            always.uniq.and_then(UniqueSetting::resolve),
            Some(UniqueJob::default())
        );
    }

    #[test]
    fn test_null_namespace() {
        let config: Config = serde_json::from_value(json!({"namespace": null})).unwrap();
        assert_eq!(config.namespace, None);
    }
}
