use anyhow::Context;
use payments_rs::config::{BusType, Config};
use payments_rs::reconciler::start_reconciler;
use payments_rs::routes::{router, AppState};
use payments_rs::shutdown::shutdown_signal;
use payments_rs::{bus, db, PaymentStore, PgPaymentStore, SettlementWorker, SubmissionService};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("Running migrations...");
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let store: Arc<dyn PaymentStore> = Arc::new(PgPaymentStore::new(pool));

    let queue = bus::connect_work_queue(&config).await?;
    queue.declare(&config.queue_name).await?;

    let reconciler = start_reconciler(
        store.clone(),
        queue.clone(),
        config.queue_name.clone(),
        config.reconcile(),
    );

    // An in-memory queue is invisible to other processes, so settle here
    let embedded_worker = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Starting embedded settlement worker");
            let worker = SettlementWorker::new(store.clone(), Arc::new(config.decider()));
            Some(worker.spawn(queue.clone(), config.queue_name.clone()))
        }
        BusType::Nats => None,
    };

    let submissions = SubmissionService::new(store, queue, config.queue_name.clone());
    let app = router(AppState {
        submissions: Arc::new(submissions),
    })
    .layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("HOST/PORT do not form a socket address")?;
    tracing::info!("Payments API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    reconciler.abort();

    // Let the worker finish the payment it is settling
    if let Some(worker) = embedded_worker {
        if let Some(stats) = worker.stop().await {
            tracing::info!(processed = stats.processed(), "Embedded settlement worker stopped");
        }
    }

    tracing::info!("Payments API stopped");
    Ok(())
}
