//! Reconciliation sweep
//!
//! Closes the gap between "payment stored" and "id published": any payment
//! still `PENDING` well after creation gets its id published again. A payment
//! that was queued after all just sees a duplicate delivery, which the worker
//! treats as a no-op once the first one settled it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use work_queue::consumer_retry::RetryConfig;
use work_queue::WorkQueue;

use crate::store::{PaymentStore, StoreError};
use crate::submission::publish_payment_id;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Minimum age of a pending payment before it is republished
    pub stale_after: Duration,
    /// Maximum ids republished per sweep
    pub batch_size: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub republished: usize,
    pub failed: usize,
}

/// Republish every stale pending payment once
///
/// Publish failures are counted and logged; the sweep moves on to the next id
/// and the next sweep picks the failed ones up again.
pub async fn sweep_once(
    store: &dyn PaymentStore,
    queue: &dyn WorkQueue,
    queue_name: &str,
    stale_after: Duration,
    limit: i64,
) -> Result<SweepReport, StoreError> {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
        .checked_sub_signed(stale_after)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let stale = store.find_stale_pending(cutoff, limit).await?;
    let mut report = SweepReport {
        scanned: stale.len(),
        ..SweepReport::default()
    };

    for payment_id in stale {
        match publish_payment_id(queue, queue_name, payment_id, &RetryConfig::no_retry()).await {
            Ok(()) => report.republished += 1,
            Err(e) => {
                tracing::warn!(payment_id = payment_id, error = %e, "Failed to republish stale payment");
                report.failed += 1;
            }
        }
    }

    if report.scanned > 0 {
        tracing::info!(
            scanned = report.scanned,
            republished = report.republished,
            failed = report.failed,
            "Reconciliation sweep republished stale payments"
        );
    }

    Ok(report)
}

/// Run [`sweep_once`] on an interval in a background task
pub fn start_reconciler(
    store: Arc<dyn PaymentStore>,
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
    config: ReconcileConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            interval_secs = config.interval.as_secs(),
            stale_after_secs = config.stale_after.as_secs(),
            "Starting reconciliation sweep"
        );

        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Err(e) = sweep_once(
                store.as_ref(),
                queue.as_ref(),
                &queue_name,
                config.stale_after,
                config.batch_size,
            )
            .await
            {
                tracing::error!(error = %e, "Reconciliation sweep failed");
            }
        }
    })
}
