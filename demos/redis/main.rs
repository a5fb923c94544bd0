//! Enqueueing demo against Redis, and Faktory when configured.
//!
//! This demo shows:
//! - Configuring worker classes with default queues, retries and uniqueness
//! - Pushing immediate and scheduled jobs in the Sidekiq format
//! - Unique jobs being skipped while their lock is held
//! - A custom middleware around every push
//! - Rebuilding a worker from a stored payload
//!
//! Prerequisites:
//! - Redis server running on localhost:6379
//! - Optionally a Faktory server, with `FAKTORY_URL=tcp://localhost:7419`
//!
//! Run with: `RUST_LOG=debug cargo run -p demo-redis`

use async_trait::async_trait;
use mbj_core::{
    Client, Config, JobOptions, LockScope, Middleware, Next, PushResult, UniqueJob, UnlockPolicy,
    Worker, WorkerDefinition,
};
use mbj_faktory::FaktoryClient;
use mbj_redis::RedisStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Logs every push that reaches the backend.
struct AuditLog;

#[async_trait]
impl Middleware for AuditLog {
    async fn call(&self, worker: Worker, backend: &str, next: Next<'_>) -> PushResult {
        let class = worker.worker_class().to_string();
        let result = next.run(worker).await;
        match &result {
            Ok(Some(payload)) => info!(class = %class, backend, jid = %payload["jid"], "audit: pushed"),
            Ok(None) => info!(class = %class, backend, "audit: skipped"),
            Err(e) => info!(class = %class, backend, error = %e, "audit: failed"),
        }
        result
    }
}

#[tokio::main]
async fn main() -> mbj_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("mbj Redis demo\n");

    let mut builder = Config::builder()
        .namespace("mbj-demo")
        .redis_url(std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost".to_string()))
        .worker(
            "Accounts::ConfirmationEmailWorker",
            WorkerDefinition::new().queue("mailer").retry(false),
        )
        .worker(
            "Elastic::BatchIndex",
            WorkerDefinition::new()
                .queue("elasticsearch")
                .retry(5)
                .uniq(UniqueJob::new(LockScope::Queue, 60, UnlockPolicy::Success)),
        );
    if let Ok(url) = std::env::var("FAKTORY_URL") {
        builder = builder.faktory_url(url);
    }
    let config = builder.build()?;

    println!("Connecting to {}...", config.redis_url);
    let store = match RedisStore::from_config(&config).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            eprintln!("Make sure Redis is running: docker run -d -p 6379:6379 redis");
            return Err(e);
        }
    };
    println!("Connected\n");

    let mut client = Client::builder()
        .store(store)
        .sidekiq()
        .unique_jobs()
        .middleware(|chain| {
            chain.add(|| AuditLog);
        });
    if config.faktory_url.is_some() {
        client = client.faktory(Some(Arc::new(FaktoryClient::from_config(&config)?)));
    }
    let client = client.config(config).build()?;
    println!("Backends: {:?}\n", client.backends());

    // Demo 1: Immediate jobs
    println!("--- Demo 1: Immediate Jobs ---\n");

    for user_id in [1, 2] {
        let payload = client
            .worker("Accounts::ConfirmationEmailWorker")?
            .with_args(vec![json!("User"), json!(user_id)])
            .push(&client, Some("sidekiq"))
            .await?;
        println!("pushed: {}", serde_json::to_string(&payload)?);
    }

    // Demo 2: Scheduled jobs
    println!("\n--- Demo 2: Scheduled Job (5 minutes) ---\n");

    let payload = client
        .worker("Accounts::ConfirmationEmailWorker")?
        .with_args(vec![json!("User"), json!(3)])
        .schedule_in(Duration::from_secs(300))
        .push(&client, Some("sidekiq"))
        .await?;
    println!("scheduled: {}", serde_json::to_string(&payload)?);

    // Demo 3: Unique jobs
    println!("\n--- Demo 3: Unique Jobs ---\n");

    let batch = || -> mbj_core::Result<Worker> {
        Ok(client
            .worker("Elastic::BatchIndex")?
            .with_args(vec![json!("users"), json!([1, 2, 3])]))
    };
    let first = client.push(batch()?, Some("sidekiq")).await?;
    let second = client.push(batch()?, Some("sidekiq")).await?;
    println!("first push enqueued: {}", first.is_some());
    println!("second push enqueued: {}", second.is_some());

    let released = client.acknowledge(&batch()?, Some("sidekiq")).await?;
    println!("lock released: {:?}", released);
    let third = client.push(batch()?, Some("sidekiq")).await?;
    println!("push after release enqueued: {}", third.is_some());

    // Demo 4: Coercing a stored payload
    println!("\n--- Demo 4: Coerce ---\n");

    if let Some(payload) = third {
        let worker = client.coerce("sidekiq", &Value::Object(payload), JobOptions::new())?;
        println!(
            "coerced: class={} queue={:?} unique={}",
            worker.worker_class(),
            worker.options().queue,
            worker.is_unique()
        );
        client.acknowledge(&worker, Some("sidekiq")).await?;
    }

    // Demo 5: Faktory
    if client.backends().contains(&"faktory") {
        println!("\n--- Demo 5: Faktory ---\n");

        let payload = client
            .worker("Accounts::ConfirmationEmailWorker")?
            .with_args(vec![json!("User"), json!(4)])
            .push(&client, Some("faktory"))
            .await?;
        println!("pushed: {}", serde_json::to_string(&payload)?);
    }

    println!("\nDone");
    Ok(())
}
