//! # mbj-core - Backend-agnostic job enqueueing
//!
//! This crate provides the core of the multi-backend job client:
//! - `Worker` builder describing one job and its scheduling
//! - `Adapter` trait with the Sidekiq and Faktory wire formats
//! - `MiddlewareChain` wrapped around every push
//! - `UniqueJob` policies enforced through sorted-set `Lock`s
//! - `Store` and `Transport` traits for the Redis and Faktory connections
//! - `Client` tying config, adapters and middleware together
//! - Error types

mod adapter;
mod client;
mod clock;
mod config;
mod error;
mod faktory;
mod job;
mod lock;
mod lock_digest;
mod middleware;
mod sidekiq;
mod store;
mod transport;
mod unique_job;
mod unique_job_middleware;
mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types
pub use adapter::{Adapter, DynAdapter};
pub use client::{Client, ClientBuilder};
pub use clock::{system_clock, Clock, SharedClock, SystemClock};
pub use config::{Config, ConfigBuilder, WorkerDefinition};
pub use error::{MbjError, Result};
pub use faktory::{retry_count, FaktoryAdapter, DEFAULT_RETRY};
pub use job::{generate_jid, rfc3339_nanos, JobOptions, JobPayload, Payload, Retry, TimeValue};
pub use lock::Lock;
pub use lock_digest::LockDigest;
pub use middleware::{BoxFuture, Middleware, MiddlewareChain, Next, PushResult, Terminal};
pub use sidekiq::{QueueKeys, SidekiqAdapter};
pub use store::{DynStore, SharedStore, Store};
pub use transport::{DynTransport, Transport};
pub use unique_job::{LockScope, UniqueJob, UniqueSetting, UnlockPolicy};
pub use unique_job_middleware::{release_unique_lock, unique_job_lock, UniqueJobMiddleware};
pub use worker::Worker;
