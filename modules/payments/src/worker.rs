//! Settlement Worker
//!
//! Consumes payment ids from the settlement queue and moves each payment from
//! `PENDING` to a terminal status. Per delivery:
//!
//! 1. Parse the payload. Garbage is logged and acked without touching the store.
//! 2. Open a settlement transaction and lock the payment row.
//! 3. If the row is already terminal, commit the empty transaction and ack.
//! 4. Otherwise ask the decider, write the terminal status and commit.
//! 5. Ack only after the commit succeeded.
//!
//! Any store failure leaves the delivery unacked so the queue redelivers it;
//! the locked re-check in step 3 makes the retry idempotent.

use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use work_queue::{Delivery, QueueResult, WorkQueue};

use crate::decider::SettlementDecider;
use crate::models::{parse_payment_id, DeadLetter, PaymentId, PaymentStatus, TerminalStatus};
use crate::store::{PaymentStore, SettlementTx, StoreError};

/// Unacked deliveries a worker may hold; one, so a busy worker receives
/// nothing until it has acked or released its current payment
pub const SETTLEMENT_PREFETCH: usize = 1;

/// Result of processing one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// Status written and committed
    Settled {
        payment_id: PaymentId,
        status: TerminalStatus,
    },
    /// Payment was already terminal; nothing written
    AlreadySettled {
        payment_id: PaymentId,
        status: PaymentStatus,
    },
    /// Payload was not a payment id
    Poison,
    /// No such payment; a dead-letter row was written
    DeadLettered { payment_id: PaymentId },
    /// Store failure; the delivery must be redelivered
    Retry {
        payment_id: Option<PaymentId>,
        reason: String,
    },
}

impl SettlementOutcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, SettlementOutcome::Retry { .. })
    }

    fn retry(payment_id: PaymentId, err: &StoreError) -> Self {
        SettlementOutcome::Retry {
            payment_id: Some(payment_id),
            reason: err.to_string(),
        }
    }
}

/// Per-outcome counters for one worker run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub settled: u64,
    pub already_settled: u64,
    pub poisoned: u64,
    pub dead_lettered: u64,
    pub retried: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &SettlementOutcome) {
        match outcome {
            SettlementOutcome::Settled { .. } => self.settled += 1,
            SettlementOutcome::AlreadySettled { .. } => self.already_settled += 1,
            SettlementOutcome::Poison => self.poisoned += 1,
            SettlementOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            SettlementOutcome::Retry { .. } => self.retried += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.settled + self.already_settled + self.poisoned + self.dead_lettered + self.retried
    }
}

#[derive(Clone)]
pub struct SettlementWorker {
    store: Arc<dyn PaymentStore>,
    decider: Arc<dyn SettlementDecider>,
    retry_delay: Duration,
}

impl SettlementWorker {
    pub fn new(store: Arc<dyn PaymentStore>, decider: Arc<dyn SettlementDecider>) -> Self {
        Self {
            store,
            decider,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Pause before releasing a delivery that failed, so a broker that
    /// redelivers immediately does not spin on a broken store
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Consume `queue_name` until `shutdown` resolves or the subscription ends
    ///
    /// Subscribes with [`SETTLEMENT_PREFETCH`]. Shutdown is only observed
    /// between deliveries: the delivery in flight is always finished (and
    /// acked or released) first.
    pub async fn run<S>(&self, queue: &dyn WorkQueue, queue_name: &str, shutdown: S) -> QueueResult<WorkerStats>
    where
        S: Future<Output = ()> + Send,
    {
        let mut deliveries = queue.subscribe(queue_name, SETTLEMENT_PREFETCH).await?;
        tracing::info!(queue = %queue_name, prefetch = SETTLEMENT_PREFETCH, "Settlement worker started");

        tokio::pin!(shutdown);
        let mut stats = WorkerStats::default();

        loop {
            let delivery = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!(queue = %queue_name, "Shutdown requested, settlement worker stopping");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        tracing::warn!(queue = %queue_name, "Settlement subscription ended");
                        break;
                    }
                },
            };

            let outcome = self.handle_delivery(delivery).await;
            stats.record(&outcome);
        }

        tracing::info!(
            settled = stats.settled,
            already_settled = stats.already_settled,
            poisoned = stats.poisoned,
            dead_lettered = stats.dead_lettered,
            retried = stats.retried,
            "Settlement worker stopped"
        );
        Ok(stats)
    }

    /// Run on a background task until [`WorkerHandle::stop`] is called
    pub fn spawn(self, queue: Arc<dyn WorkQueue>, queue_name: String) -> WorkerHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let shutdown = async move {
                // A dropped handle also stops the worker
                let _ = stopped.wait_for(|stop| *stop).await;
            };
            self.run(queue.as_ref(), &queue_name, shutdown).await
        });
        WorkerHandle { stop, task }
    }

    /// Settle one delivery, then ack it or release it for redelivery
    pub async fn handle_delivery(&self, delivery: Delivery) -> SettlementOutcome {
        let span = tracing::info_span!(
            "settle_payment",
            queue = %delivery.queue,
            payload = %String::from_utf8_lossy(&delivery.payload),
        );

        async move {
            let outcome = self.settle(&delivery.queue, &delivery.payload).await;

            if outcome.should_ack() {
                if let Err(e) = delivery.ack().await {
                    // Redelivery will find the payment terminal and no-op
                    tracing::warn!(error = %e, "Failed to ack settlement delivery");
                }
            } else {
                if !self.retry_delay.is_zero() {
                    tokio::time::sleep(self.retry_delay).await;
                }
                drop(delivery);
            }

            outcome
        }
        .instrument(span)
        .await
    }

    /// Run the settlement state machine for one payload
    ///
    /// Does not ack; the caller acts on [`SettlementOutcome::should_ack`].
    pub async fn settle(&self, queue: &str, payload: &[u8]) -> SettlementOutcome {
        let Some(payment_id) = parse_payment_id(payload) else {
            tracing::warn!(
                payload = %String::from_utf8_lossy(payload),
                "Dropping settlement message that is not a payment id"
            );
            return SettlementOutcome::Poison;
        };

        let mut tx = match self.store.begin_settlement().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!(payment_id = payment_id, error = %e, "Failed to open settlement transaction");
                return SettlementOutcome::retry(payment_id, &e);
            }
        };

        let current = match tx.lock_for_settlement(payment_id).await {
            Ok(status) => status,
            Err(StoreError::NotFound(_)) => {
                abandon(tx, payment_id).await;
                return self.dead_letter(queue, payload, payment_id).await;
            }
            Err(e) => {
                tracing::error!(payment_id = payment_id, error = %e, "Failed to lock payment");
                abandon(tx, payment_id).await;
                return SettlementOutcome::retry(payment_id, &e);
            }
        };

        if current.is_terminal() {
            if let Err(e) = tx.commit().await {
                tracing::error!(payment_id = payment_id, error = %e, "Failed to release settled payment");
                return SettlementOutcome::retry(payment_id, &e);
            }
            tracing::info!(payment_id = payment_id, status = %current, "Payment already settled, skipping");
            return SettlementOutcome::AlreadySettled {
                payment_id,
                status: current,
            };
        }

        let decision = self.decider.decide(payment_id).await;

        if let Err(e) = tx.set_terminal_status(payment_id, decision).await {
            tracing::error!(payment_id = payment_id, error = %e, "Failed to write settlement status");
            abandon(tx, payment_id).await;
            return SettlementOutcome::retry(payment_id, &e);
        }

        if let Err(e) = tx.commit().await {
            tracing::error!(payment_id = payment_id, error = %e, "Failed to commit settlement, leaving for redelivery");
            return SettlementOutcome::retry(payment_id, &e);
        }

        tracing::info!(payment_id = payment_id, status = %decision, "Payment settled");
        SettlementOutcome::Settled {
            payment_id,
            status: decision,
        }
    }

    async fn dead_letter(&self, queue: &str, payload: &[u8], payment_id: PaymentId) -> SettlementOutcome {
        let dead_letter = DeadLetter {
            queue: queue.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            reason: format!("payment {} not found", payment_id),
        };

        match self.store.record_dead_letter(&dead_letter).await {
            Ok(()) => {
                tracing::error!(payment_id = payment_id, "Settlement for unknown payment moved to dead letters");
                SettlementOutcome::DeadLettered { payment_id }
            }
            Err(e) => {
                tracing::error!(payment_id = payment_id, error = %e, "Failed to record dead letter");
                SettlementOutcome::retry(payment_id, &e)
            }
        }
    }
}

/// A settlement worker running on a background task
pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<QueueResult<WorkerStats>>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wait until the delivery in flight is
    /// finished. `None` when the worker failed; the failure is logged.
    pub async fn stop(self) -> Option<WorkerStats> {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Settlement worker failed");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Settlement worker task panicked");
                None
            }
        }
    }
}

async fn abandon(mut tx: Box<dyn SettlementTx>, payment_id: PaymentId) {
    if let Err(e) = tx.rollback().await {
        // The transaction is dropped either way, which also rolls it back
        tracing::debug!(payment_id = payment_id, error = %e, "Rollback failed");
    }
}
