use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Initialize a connection pool to the PostgreSQL database
///
/// Every in-flight settlement holds one connection for the length of its
/// transaction, decider latency included, so the default is sized for a
/// handful of workers sharing one process.
///
/// Overrides: `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS`, `DB_ACQUIRE_TIMEOUT_SECS`.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let max_connections = env_or("DB_MAX_CONNECTIONS", 25u32);
    let min_connections = env_or("DB_MIN_CONNECTIONS", 0u32);
    let acquire_timeout_secs = env_or("DB_ACQUIRE_TIMEOUT_SECS", 3u64);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .max_lifetime(Duration::from_secs(300))
        .connect(database_url)
        .await
}

/// Apply the embedded migrations under `db/migrations`
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./db/migrations").run(pool).await
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
