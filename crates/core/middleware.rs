//! Interceptor pipeline wrapped around every push.
//!
//! Entries are keyed by middleware type. Every [`MiddlewareChain::invoke`]
//! builds fresh instances from the registered factories, so no middleware
//! state survives from one push to the next.

use async_trait::async_trait;
use std::any::{type_name, TypeId};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::job::Payload;
use crate::worker::Worker;

/// A boxed future used by the middleware system.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a push: the written payload, or `None` when a middleware
/// vetoed it.
pub type PushResult = Result<Option<Payload>>;

/// The innermost step of a chain, normally an adapter's push.
pub type Terminal<'a> = Box<dyn FnOnce(Worker) -> BoxFuture<'a, PushResult> + Send + 'a>;

/// Code run around a push.
///
/// A middleware continues by calling [`Next::run`]. Returning without doing
/// so short-circuits the chain: inner middleware and the backend write are
/// skipped and the returned value becomes the push result.
///
/// # Example
///
/// ```rust,ignore
/// struct Audit;
///
/// #[async_trait::async_trait]
/// impl Middleware for Audit {
///     async fn call(&self, worker: Worker, backend: &str, next: Next<'_>) -> PushResult {
///         tracing::info!(class = worker.worker_class(), backend, "pushing");
///         next.run(worker).await
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn call(&self, worker: Worker, backend: &str, next: Next<'_>) -> PushResult;
}

/// The rest of the chain, from the current layer inwards.
pub struct Next<'a> {
    remaining: Vec<Box<dyn Middleware>>,
    backend: &'a str,
    terminal: Terminal<'a>,
}

impl<'a> Next<'a> {
    /// Pass control to the next inner middleware, or to the terminal step.
    pub fn run(mut self, worker: Worker) -> BoxFuture<'a, PushResult> {
        match self.remaining.pop() {
            Some(middleware) => Box::pin(async move {
                let backend = self.backend;
                middleware.call(worker, backend, self).await
            }),
            None => (self.terminal)(worker),
        }
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn Middleware> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    type_id: TypeId,
    name: &'static str,
    factory: Factory,
}

impl Entry {
    fn new<M, F>(factory: F) -> Self
    where
        M: Middleware,
        F: Fn() -> M + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<M>(),
            name: type_name::<M>(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Middleware>),
        }
    }
}

/// Ordered middleware registrations.
///
/// The last registered entry is the outermost layer.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Entry>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, type_id: TypeId) -> Option<usize> {
        self.entries.iter().position(|e| e.type_id == type_id)
    }

    /// Take out the existing entry for `M`, or build a new one.
    fn take_or_new<M, F>(&mut self, factory: F) -> Entry
    where
        M: Middleware,
        F: Fn() -> M + Send + Sync + 'static,
    {
        match self.position(TypeId::of::<M>()) {
            Some(i) => self.entries.remove(i),
            None => Entry::new(factory),
        }
    }

    /// Append `M` as the outermost layer, replacing any earlier registration.
    pub fn add<M, F>(&mut self, factory: F) -> &mut Self
    where
        M: Middleware,
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.remove::<M>();
        self.entries.push(Entry::new(factory));
        self
    }

    /// Insert `M` as the innermost layer, replacing any earlier registration.
    pub fn prepend<M, F>(&mut self, factory: F) -> &mut Self
    where
        M: Middleware,
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.remove::<M>();
        self.entries.insert(0, Entry::new(factory));
        self
    }

    /// Place `M` right before `Anchor`, or first when `Anchor` is absent.
    ///
    /// An existing registration of `M` is moved and keeps its factory.
    pub fn insert_before<Anchor, M, F>(&mut self, factory: F) -> &mut Self
    where
        Anchor: Middleware,
        M: Middleware,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let entry = self.take_or_new(factory);
        let i = self.position(TypeId::of::<Anchor>()).unwrap_or(0);
        self.entries.insert(i, entry);
        self
    }

    /// Place `M` right after `Anchor`, or last when `Anchor` is absent.
    ///
    /// An existing registration of `M` is moved and keeps its factory.
    pub fn insert_after<Anchor, M, F>(&mut self, factory: F) -> &mut Self
    where
        Anchor: Middleware,
        M: Middleware,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let entry = self.take_or_new(factory);
        let i = self
            .position(TypeId::of::<Anchor>())
            .map(|i| i + 1)
            .unwrap_or(self.entries.len());
        self.entries.insert(i, entry);
        self
    }

    /// Drop the registration of `M`, if any.
    pub fn remove<M: Middleware>(&mut self) -> &mut Self {
        let type_id = TypeId::of::<M>();
        self.entries.retain(|e| e.type_id != type_id);
        self
    }

    pub fn exists<M: Middleware>(&self) -> bool {
        self.position(TypeId::of::<M>()).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Type names of the registered middleware, innermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// Run `worker` through fresh middleware instances and then `terminal`.
    pub async fn invoke<'a, T>(&self, worker: Worker, backend: &'a str, terminal: T) -> PushResult
    where
        T: FnOnce(Worker) -> BoxFuture<'a, PushResult> + Send + 'a,
    {
        let next = Next {
            remaining: self.entries.iter().map(|e| (e.factory)()).collect(),
            backend,
            terminal: Box::new(terminal),
        };
        next.run(worker).await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
