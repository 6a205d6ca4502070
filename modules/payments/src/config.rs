use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::decider::{SimulatedDecider, DEFAULT_FAILURE_RATE};
use crate::reconciler::ReconcileConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "nats" => Ok(BusType::Nats),
            "inmemory" => Ok(BusType::InMemory),
            other => Err(ConfigError::Invalid {
                name: "BUS_TYPE",
                reason: format!("{} (must be 'inmemory' or 'nats')", other),
            }),
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: BusType,
    pub nats_url: String,
    pub queue_name: String,
    pub host: String,
    pub port: u16,
    pub settlement_latency: Duration,
    pub settlement_failure_rate: f64,
    pub reconcile_interval: Duration,
    pub reconcile_stale_after: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source, e.g. a map in tests
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let bus_type = BusType::parse(&var("BUS_TYPE", "inmemory"))?;
        let nats_url = var("NATS_URL", "nats://localhost:4222");
        let queue_name = var("PAYMENTS_QUEUE", "payments");
        let host = var("HOST", "0.0.0.0");
        let port: u16 = parse("PORT", &var("PORT", "8080"))?;

        if let Some(prefetch) = lookup("WORKER_PREFETCH") {
            if prefetch.trim() != "1" {
                return Err(ConfigError::Invalid {
                    name: "WORKER_PREFETCH",
                    reason: format!("{:?}: settlement workers always hold exactly 1 unacked message", prefetch),
                });
            }
        }

        let latency_ms: u64 = parse("SETTLEMENT_LATENCY_MS", &var("SETTLEMENT_LATENCY_MS", "2000"))?;

        let settlement_failure_rate: f64 = parse(
            "SETTLEMENT_FAILURE_RATE",
            &var("SETTLEMENT_FAILURE_RATE", &DEFAULT_FAILURE_RATE.to_string()),
        )?;
        if !(0.0..=1.0).contains(&settlement_failure_rate) {
            return Err(ConfigError::Invalid {
                name: "SETTLEMENT_FAILURE_RATE",
                reason: format!("{} is outside 0..=1", settlement_failure_rate),
            });
        }

        let reconcile_interval_secs: u64 =
            parse("RECONCILE_INTERVAL_SECS", &var("RECONCILE_INTERVAL_SECS", "30"))?;
        if reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "RECONCILE_INTERVAL_SECS",
                reason: "must be at least 1".to_string(),
            });
        }
        let reconcile_stale_after_secs: u64 =
            parse("RECONCILE_STALE_AFTER_SECS", &var("RECONCILE_STALE_AFTER_SECS", "60"))?;

        Ok(Config {
            database_url,
            bus_type,
            nats_url,
            queue_name,
            host,
            port,
            settlement_latency: Duration::from_millis(latency_ms),
            settlement_failure_rate,
            reconcile_interval: Duration::from_secs(reconcile_interval_secs),
            reconcile_stale_after: Duration::from_secs(reconcile_stale_after_secs),
        })
    }

    pub fn decider(&self) -> SimulatedDecider {
        SimulatedDecider::new(self.settlement_latency, self.settlement_failure_rate)
    }

    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: self.reconcile_interval,
            stale_after: self.reconcile_stale_after,
            ..ReconcileConfig::default()
        }
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: format!("{:?}: {}", value, e),
    })
}
