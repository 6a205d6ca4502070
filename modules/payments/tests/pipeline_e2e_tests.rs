//! End-to-end pipeline tests: submit → queue → worker → store
//!
//! Everything runs in-process against the in-memory store and queue.

mod common;

use common::{submission, Harness, QUEUE};
use payments_rs::models::{PaymentStatus, TerminalStatus};
use payments_rs::reconciler::sweep_once;
use payments_rs::{PaymentStore, SubmitError};
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::oneshot;

#[tokio::test]
async fn test_submit_then_settle() {
    let harness = Harness::new(TerminalStatus::Success).await;

    let payment = harness
        .submissions
        .submit(submission(dec!(100.00), "USD", "R1"))
        .await
        .unwrap();
    assert_eq!(payment.id, 1);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, dec!(100.00));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let worker = harness.worker();
    let queue = harness.queue.clone();
    let handle = tokio::spawn(async move {
        worker
            .run(&queue, QUEUE, async move {
                stop_rx.await.ok();
            })
            .await
    });

    harness.wait_until_drained(Duration::from_secs(5)).await;

    let settled = harness.store.get(payment.id).await.unwrap();
    assert!(settled.status.is_terminal());
    assert_eq!(settled.status, PaymentStatus::Success);
    assert_eq!(settled.created_at, payment.created_at);

    // Redeliver the same id: nothing changes
    harness
        .submissions
        .submit(submission(dec!(5.00), "ETB", "R2"))
        .await
        .unwrap();
    work_queue::WorkQueue::publish(&harness.queue, QUEUE, b"1".to_vec())
        .await
        .unwrap();
    harness.wait_until_drained(Duration::from_secs(5)).await;

    stop_tx.send(()).unwrap();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.settled, 2);
    assert_eq!(stats.already_settled, 1);
    assert_eq!(harness.decider.calls(), 2);
    assert_eq!(
        harness.store.get(payment.id).await.unwrap().status,
        PaymentStatus::Success
    );
}

#[tokio::test]
async fn test_invalid_submission_leaves_no_trace() {
    let harness = Harness::new(TerminalStatus::Success).await;

    let err = harness
        .submissions
        .submit(submission(dec!(-5), "USD", "R1"))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Validation(_)));

    let err = harness
        .submissions
        .submit(submission(dec!(5), "EUR", "R2"))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Validation(_)));

    assert_eq!(harness.store.payment_count(), 0);
    assert_eq!(harness.queue.ready_count(QUEUE), 0);
}

#[tokio::test]
async fn test_duplicate_reference_rejected_and_not_requeued() {
    let harness = Harness::new(TerminalStatus::Success).await;

    let first = harness
        .submissions
        .submit(submission(dec!(1.00), "USD", "DUP"))
        .await
        .unwrap();
    let err = harness
        .submissions
        .submit(submission(dec!(2.00), "ETB", "DUP"))
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::DuplicateReference(ref r) if r == "DUP"));
    assert_eq!(harness.store.payment_count(), 1);
    assert_eq!(harness.queue.ready_count(QUEUE), 1);
    assert_eq!(harness.store.get(first.id).await.unwrap().amount, dec!(1.00));
}

#[tokio::test]
async fn test_distinct_references_get_fresh_ids() {
    let harness = Harness::new(TerminalStatus::Success).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let payment = harness
            .submissions
            .submit(submission(dec!(3.50), "ETB", &format!("ref-{}", i)))
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        ids.push(payment.id);
    }

    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 5, "ids must not repeat: {:?}", ids);
    assert_eq!(harness.queue.ready_count(QUEUE), 5);
}

#[tokio::test]
async fn test_unqueued_payment_is_recovered_by_sweep() {
    let harness = Harness::new(TerminalStatus::Failed).await;

    // Stored but never published, as after a broker outage
    let payment = harness
        .store
        .insert(payments_rs::models::NewPayment {
            amount: dec!(42.00),
            currency: payments_rs::Currency::Usd,
            reference: "orphan".to_string(),
        })
        .await
        .unwrap();
    harness
        .store
        .set_created_at(payment.id, chrono::Utc::now() - chrono::Duration::minutes(5));
    assert_eq!(harness.queue.ready_count(QUEUE), 0);

    let report = sweep_once(
        &harness.store,
        &harness.queue,
        QUEUE,
        Duration::from_secs(60),
        100,
    )
    .await
    .unwrap();
    assert_eq!(report.republished, 1);

    let worker = harness.worker();
    let outcome = worker.settle(QUEUE, payment.id.to_string().as_bytes()).await;
    assert!(outcome.should_ack());
    assert_eq!(
        harness.store.get(payment.id).await.unwrap().status,
        PaymentStatus::Failed
    );

    // Settled payments are no longer swept
    let report = sweep_once(
        &harness.store,
        &harness.queue,
        QUEUE,
        Duration::from_secs(60),
        100,
    )
    .await
    .unwrap();
    assert_eq!(report.scanned, 0);
}
