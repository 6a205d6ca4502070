//! Settlement worker process
//!
//! Run as many of these as needed against the NATS queue; they share one
//! durable consumer, so each payment id goes to one worker at a time.

use anyhow::Context;
use payments_rs::config::{BusType, Config};
use payments_rs::shutdown::shutdown_signal;
use payments_rs::{bus, db, PgPaymentStore, SettlementWorker};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;

    if config.bus_type == BusType::InMemory {
        tracing::warn!(
            "BUS_TYPE=inmemory: this worker only sees its own in-process queue; \
             the API process runs an embedded worker instead"
        );
    }

    let pool = db::init_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let queue = bus::connect_work_queue(&config).await?;
    queue.declare(&config.queue_name).await?;

    let worker = SettlementWorker::new(
        Arc::new(PgPaymentStore::new(pool)),
        Arc::new(config.decider()),
    );

    let stats = worker
        .run(queue.as_ref(), &config.queue_name, shutdown_signal())
        .await?;

    tracing::info!(processed = stats.processed(), "Settlement worker exited");
    Ok(())
}
