//! Client for enqueueing jobs.
//!
//! The client is the process-wide handle: it owns the validated config, the
//! store, the clock, the registered adapters and the middleware chain. Build
//! it once at startup and share it (it is cheap to wrap in an `Arc`).

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::adapter::{Adapter, DynAdapter};
use crate::clock::{system_clock, Clock, SharedClock};
use crate::config::Config;
use crate::error::{MbjError, Result};
use crate::faktory::FaktoryAdapter;
use crate::job::JobOptions;
use crate::middleware::{MiddlewareChain, PushResult};
use crate::sidekiq::SidekiqAdapter;
use crate::store::{SharedStore, Store};
use crate::transport::DynTransport;
use crate::unique_job_middleware::UniqueJobMiddleware;
use crate::worker::Worker;

/// Client for enqueueing jobs to one of several backends.
pub struct Client {
    config: Config,
    store: Option<SharedStore>,
    clock: SharedClock,
    adapters: BTreeMap<String, DynAdapter>,
    middleware: MiddlewareChain,
}

impl Client {
    /// Create a new builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// A worker for `class`, carrying its configured defaults.
    ///
    /// Fails with [`MbjError::NotDefinedWorker`] in strict mode when the class
    /// has no definition.
    pub fn worker(&self, class: &str) -> Result<Worker> {
        let definition = self.config.worker_definition(class)?;
        Ok(Worker::new(class)
            .with_clock(self.clock.clone())
            .with_options(definition.options)
            .unique(definition.uniq.unwrap_or_default()))
    }

    fn resolve(&self, backend: Option<&str>) -> Result<(&str, &DynAdapter)> {
        backend
            .and_then(|name| self.adapters.get_key_value(name))
            .map(|(name, adapter)| (name.as_str(), adapter))
            .ok_or_else(|| MbjError::UnsupportedBackend {
                backend: backend.unwrap_or_default().to_string(),
                available: self.backends().into_iter().map(str::to_string).collect(),
            })
    }

    /// Push `worker` to `backend`, or to its default backend.
    ///
    /// Stamps `created_at` and the job id when missing, then runs the
    /// middleware chain around the adapter's push. Returns `Ok(None)` when a
    /// middleware vetoed the push.
    pub async fn push(&self, worker: Worker, backend: Option<&str>) -> PushResult {
        let requested = backend
            .map(str::to_string)
            .or_else(|| worker.options().backend.clone());
        let (name, adapter) = self.resolve(requested.as_deref())?;

        let mut worker = worker.with_job_jid(None);
        if worker.payload().created_at.is_none() {
            worker.payload_mut().created_at = Some(worker.now());
        }
        debug!(
            class = worker.worker_class(),
            jid = ?worker.payload().jid,
            backend = name,
            "Pushing job"
        );

        let adapter = Arc::clone(adapter);
        self.middleware
            .invoke(worker, name, move |worker| {
                Box::pin(async move { adapter.push(worker).await })
            })
            .await
    }

    /// Release `worker`'s uniqueness lock on `backend`, or its default backend.
    pub async fn acknowledge(&self, worker: &Worker, backend: Option<&str>) -> Result<Option<bool>> {
        let requested = backend.or(worker.options().backend.as_deref());
        let (name, adapter) = self.resolve(requested)?;
        adapter.acknowledge(worker, name).await
    }

    /// Rebuild a worker from a raw `backend` payload.
    ///
    /// Precedence is caller `options`, then payload values, then the class's
    /// configured defaults. Strict mode applies.
    pub fn coerce(&self, backend: &str, payload: &Value, options: JobOptions) -> Result<Worker> {
        let (_, adapter) = self.resolve(Some(backend))?;
        let worker = adapter.coerce_to_worker(payload, options)?;
        let definition = self.config.worker_definition(worker.worker_class())?;

        let options = worker.options().clone().merge_defaults(&definition.options);
        let mut worker = worker.with_options(options).with_clock(self.clock.clone());
        if !worker.is_unique() {
            if let Some(setting) = definition.uniq {
                worker = worker.unique(setting);
            }
        }
        Ok(worker)
    }

    /// Registered backend keys, sorted.
    pub fn backends(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    pub fn adapter(&self, backend: &str) -> Option<&DynAdapter> {
        self.adapters.get(backend)
    }

    pub fn store(&self) -> Option<&SharedStore> {
        self.store.as_ref()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    pub fn middleware_mut(&mut self) -> &mut MiddlewareChain {
        &mut self.middleware
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("backends", &self.backends())
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

enum PendingAdapter {
    Ready(DynAdapter),
    Sidekiq,
    Faktory(Option<DynTransport>),
}

/// Builder for Client.
pub struct ClientBuilder {
    config: Config,
    store: Option<SharedStore>,
    clock: SharedClock,
    adapters: Vec<(String, PendingAdapter)>,
    middleware: MiddlewareChain,
    unique_jobs: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: None,
            clock: system_clock(),
            adapters: Vec::new(),
            middleware: MiddlewareChain::new(),
            unique_jobs: false,
        }
    }
}

impl ClientBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the store holding locks and Redis-list queues.
    pub fn store(mut self, store: impl Store + 'static) -> Self {
        self.store = Some(SharedStore::new(store));
        self
    }

    /// Set an already shared store.
    pub fn shared_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Register a custom adapter under `backend`.
    pub fn adapter(mut self, backend: impl Into<String>, adapter: impl Adapter + 'static) -> Self {
        self.adapters
            .push((backend.into(), PendingAdapter::Ready(Arc::new(adapter))));
        self
    }

    /// Register the Sidekiq wire format under `"sidekiq"`. Requires a store.
    pub fn sidekiq(mut self) -> Self {
        self.adapters
            .push((SidekiqAdapter::BACKEND.to_string(), PendingAdapter::Sidekiq));
        self
    }

    /// Register the Faktory wire format under `"faktory"`.
    ///
    /// Without a transport, pushes to it fail with a configuration error.
    pub fn faktory(mut self, transport: Option<DynTransport>) -> Self {
        self.adapters
            .push((FaktoryAdapter::BACKEND.to_string(), PendingAdapter::Faktory(transport)));
        self
    }

    /// Edit the middleware chain.
    pub fn middleware(mut self, configure: impl FnOnce(&mut MiddlewareChain)) -> Self {
        configure(&mut self.middleware);
        self
    }

    /// Enforce uniqueness policies. Requires a store.
    ///
    /// The uniqueness middleware is added as the outermost layer unless the
    /// chain already has one.
    pub fn unique_jobs(mut self) -> Self {
        self.unique_jobs = true;
        self
    }

    fn require_store(&self, what: &str) -> Result<SharedStore> {
        self.store
            .clone()
            .ok_or_else(|| MbjError::Config(format!("{} requires a store", what)))
    }

    /// Validate the config and build the Client.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;

        let mut middleware = self.middleware.clone();
        if self.unique_jobs && !middleware.exists::<UniqueJobMiddleware>() {
            let store = self.require_store("unique jobs")?;
            let namespace = self.config.namespace.clone();
            middleware.add(move || UniqueJobMiddleware::new(store.clone(), namespace.clone()));
        }

        let mut adapters: BTreeMap<String, DynAdapter> = BTreeMap::new();
        for (name, pending) in &self.adapters {
            let adapter: DynAdapter = match pending {
                PendingAdapter::Ready(adapter) => adapter.clone(),
                PendingAdapter::Sidekiq => Arc::new(SidekiqAdapter::new(
                    self.require_store("the sidekiq backend")?,
                    self.config.namespace.clone(),
                    self.clock.clone(),
                )),
                PendingAdapter::Faktory(transport) => {
                    Arc::new(FaktoryAdapter::new(transport.clone(), self.clock.clone()))
                }
            };
            adapters.insert(name.clone(), adapter);
        }

        Ok(Client {
            config: self.config,
            store: self.store,
            clock: self.clock,
            adapters,
            middleware,
        })
    }
}
