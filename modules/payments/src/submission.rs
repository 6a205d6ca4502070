//! Submission Path
//!
//! Persist first, publish second. A payment that was stored but could not be
//! queued is reported as `QueueUnavailable` with the stored record; the
//! reconciliation sweep publishes it later.

use std::sync::Arc;
use thiserror::Error;
use work_queue::consumer_retry::{retry_with_backoff_if, RetryConfig};
use work_queue::{QueueError, WorkQueue};

use crate::models::{encode_payment_id, Payment, PaymentId, SubmitPayment};
use crate::store::{PaymentStore, StoreError};
use crate::validation::{validate_submission, ValidationError};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("reference already exists: {0}")]
    DuplicateReference(String),

    /// The payment is stored and pending but its id never reached the queue
    #[error("payment {} accepted but not queued: {reason}", .payment.id)]
    QueueUnavailable { payment: Box<Payment>, reason: String },

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(e) => SubmitError::Validation(e),
            StoreError::DuplicateReference(reference) => SubmitError::DuplicateReference(reference),
            other => SubmitError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn PaymentStore>,
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
    retry: RetryConfig,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        queue: Arc<dyn WorkQueue>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            queue_name: queue_name.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Validate, persist as `PENDING`, then enqueue the id for settlement
    pub async fn submit(&self, request: SubmitPayment) -> Result<Payment, SubmitError> {
        let new_payment = validate_submission(&request)?;
        let payment = self.store.insert(new_payment).await?;

        tracing::info!(
            payment_id = payment.id,
            reference = %payment.reference,
            amount = %payment.amount,
            currency = %payment.currency,
            "Payment recorded"
        );

        if let Err(e) =
            publish_payment_id(self.queue.as_ref(), &self.queue_name, payment.id, &self.retry).await
        {
            tracing::error!(
                payment_id = payment.id,
                error = %e,
                "Payment recorded but not queued for settlement"
            );
            return Err(SubmitError::QueueUnavailable {
                payment: Box::new(payment),
                reason: e.to_string(),
            });
        }

        Ok(payment)
    }

    pub async fn get(&self, id: PaymentId) -> Result<Payment, StoreError> {
        self.store.get(id).await
    }
}

/// Publish a payment id, retrying transient broker failures with backoff
pub async fn publish_payment_id(
    queue: &dyn WorkQueue,
    queue_name: &str,
    payment_id: PaymentId,
    retry: &RetryConfig,
) -> Result<(), QueueError> {
    retry_with_backoff_if(
        || queue.publish(queue_name, encode_payment_id(payment_id)),
        QueueError::is_transient,
        retry,
        "publish_payment_id",
    )
    .await?;

    tracing::debug!(payment_id = payment_id, queue = %queue_name, "Payment queued for settlement");
    Ok(())
}
