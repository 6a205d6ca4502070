use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

use super::{PaymentStore, SettlementTx, StoreError};
use crate::models::{DeadLetter, NewPayment, Payment, PaymentId, PaymentStatus, TerminalStatus};
use crate::validation::validate_new_payment;

/// PaymentStore implementation held entirely in memory
///
/// Suitable for unit/integration tests and local development. Row locks are
/// emulated with one `tokio::sync::Mutex` per payment, so two settlement
/// transactions on the same id serialize the same way `FOR UPDATE` does.
///
/// Test hooks:
/// - `fail_next_commits(n)` makes the next `n` settlement commits fail
/// - `set_unavailable(true)` makes every call fail as if the database was down
/// - `access_count()` counts trait calls, to assert a path never touched the store
#[derive(Clone, Default)]
pub struct InMemoryPaymentStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<PaymentId, Arc<tokio::sync::Mutex<()>>>>,
    failing_commits: AtomicUsize,
    unavailable: AtomicBool,
    accesses: AtomicUsize,
}

#[derive(Default)]
struct Tables {
    payments: BTreeMap<PaymentId, Payment>,
    last_id: PaymentId,
    dead_letters: Vec<DeadLetter>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.inner.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn access_count(&self) -> usize {
        self.inner.accesses.load(Ordering::SeqCst)
    }

    pub fn payment_count(&self) -> usize {
        self.tables().payments.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.tables().dead_letters.clone()
    }

    /// Rewrite `created_at`, e.g. to make a payment look stale
    pub fn set_created_at(&self, id: PaymentId, created_at: DateTime<Utc>) -> bool {
        match self.tables().payments.get_mut(&id) {
            Some(payment) => {
                payment.created_at = created_at;
                true
            }
            None => false,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Row locks currently tracked, held or awaited
    pub fn row_lock_count(&self) -> usize {
        self.row_locks().len()
    }

    fn row_locks(&self) -> MutexGuard<'_, HashMap<PaymentId, Arc<tokio::sync::Mutex<()>>>> {
        self.inner.row_locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, id: PaymentId) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks().entry(id).or_default().clone()
    }

    /// Forget row locks nobody holds or waits for
    fn prune_row_locks(&self, ids: &[PaymentId]) {
        let mut locks = self.row_locks();
        for id in ids {
            if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(id);
            }
        }
    }

    fn status_of(&self, id: PaymentId) -> Option<PaymentStatus> {
        self.tables().payments.get(&id).map(|p| p.status)
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.inner.accesses.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn take_commit_failure(&self) -> bool {
        self.inner
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        self.enter()?;
        validate_new_payment(&payment)?;

        let mut tables = self.tables();
        if tables
            .payments
            .values()
            .any(|existing| existing.reference == payment.reference)
        {
            return Err(StoreError::DuplicateReference(payment.reference));
        }

        tables.last_id += 1;
        let record = Payment {
            id: tables.last_id,
            amount: payment.amount,
            currency: payment.currency,
            reference: payment.reference,
            status: PaymentStatus::Pending,
            created_at: Utc::now(),
        };
        tables.payments.insert(record.id, record.clone());

        Ok(record)
    }

    async fn get(&self, id: PaymentId) -> Result<Payment, StoreError> {
        self.enter()?;
        self.tables()
            .payments
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn begin_settlement(&self) -> Result<Box<dyn SettlementTx>, StoreError> {
        self.enter()?;
        Ok(Box::new(InMemorySettlementTx {
            store: self.clone(),
            guards: HashMap::new(),
            staged: Vec::new(),
            finished: false,
        }))
    }

    async fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentId>, StoreError> {
        self.enter()?;
        let tables = self.tables();
        let mut stale: Vec<&Payment> = tables
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at < created_before)
            .collect();
        stale.sort_by_key(|p| (p.created_at, p.id));

        Ok(stale
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|p| p.id)
            .collect())
    }

    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), StoreError> {
        self.enter()?;
        self.tables().dead_letters.push(dead_letter.clone());
        Ok(())
    }
}

struct InMemorySettlementTx {
    store: InMemoryPaymentStore,
    guards: HashMap<PaymentId, OwnedMutexGuard<()>>,
    staged: Vec<(PaymentId, TerminalStatus)>,
    finished: bool,
}

impl InMemorySettlementTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }
        self.store.check_available()
    }

    /// Status as seen from inside this transaction
    fn visible_status(&self, id: PaymentId) -> Option<PaymentStatus> {
        self.staged
            .iter()
            .rev()
            .find(|(staged_id, _)| *staged_id == id)
            .map(|(_, status)| PaymentStatus::from(*status))
            .or_else(|| self.store.status_of(id))
    }

    fn release(&mut self) {
        self.finished = true;
        self.staged.clear();
        let locked: Vec<PaymentId> = self.guards.keys().copied().collect();
        // Guards must go first so their Arc clones are gone when pruning
        self.guards.clear();
        self.store.prune_row_locks(&locked);
    }
}

impl Drop for InMemorySettlementTx {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
        }
    }
}

#[async_trait]
impl SettlementTx for InMemorySettlementTx {
    async fn lock_for_settlement(&mut self, id: PaymentId) -> Result<PaymentStatus, StoreError> {
        self.ensure_open()?;

        if !self.guards.contains_key(&id) {
            // Like FOR UPDATE on a missing row: nothing to lock
            if self.store.status_of(id).is_none() {
                return Err(StoreError::NotFound(id));
            }
            let guard = self.store.row_lock(id).lock_owned().await;
            self.guards.insert(id, guard);
        }

        self.visible_status(id).ok_or(StoreError::NotFound(id))
    }

    async fn set_terminal_status(
        &mut self,
        id: PaymentId,
        status: TerminalStatus,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;

        if !self.guards.contains_key(&id) {
            return Err(StoreError::LockNotHeld(id));
        }
        if self.visible_status(id) != Some(PaymentStatus::Pending) {
            return Err(StoreError::AlreadyTerminal(id));
        }

        self.staged.push((id, status));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }

        if self.store.take_commit_failure() {
            self.release();
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        if let Err(e) = self.store.check_available() {
            self.release();
            return Err(e);
        }

        {
            let mut tables = self.store.tables();
            for (id, status) in &self.staged {
                if let Some(payment) = tables.payments.get_mut(id) {
                    payment.status = (*status).into();
                }
            }
        }

        self.release();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }
        self.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Currency;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn new_payment(reference: &str) -> NewPayment {
        NewPayment {
            amount: dec!(25.50),
            currency: Currency::Etb,
            reference: reference.to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids_and_pending_status() {
        let store = InMemoryPaymentStore::new();
        let first = store.insert(new_payment("A")).await.unwrap();
        let second = store.insert(new_payment("B")).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.status, PaymentStatus::Pending);
        assert_eq!(store.get(2).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_duplicate_reference_rejected_without_consuming_id() {
        let store = InMemoryPaymentStore::new();
        store.insert(new_payment("A")).await.unwrap();

        let err = store.insert(new_payment("A")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReference(r) if r == "A"));

        let next = store.insert(new_payment("B")).await.unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(store.payment_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_amount_rejected_by_store() {
        let store = InMemoryPaymentStore::new();
        let mut payment = new_payment("A");
        payment.amount = dec!(-1);

        let err = store.insert(payment).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.payment_count(), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_write_is_invisible_and_rolled_back_on_drop() {
        let store = InMemoryPaymentStore::new();
        let payment = store.insert(new_payment("A")).await.unwrap();

        let mut tx = store.begin_settlement().await.unwrap();
        assert_eq!(tx.lock_for_settlement(payment.id).await.unwrap(), PaymentStatus::Pending);
        tx.set_terminal_status(payment.id, TerminalStatus::Success)
            .await
            .unwrap();
        assert_eq!(tx.lock_for_settlement(payment.id).await.unwrap(), PaymentStatus::Success);
        assert_eq!(store.get(payment.id).await.unwrap().status, PaymentStatus::Pending);

        drop(tx);
        assert_eq!(store.get(payment.id).await.unwrap().status, PaymentStatus::Pending);

        // Lock was released by the drop
        let mut tx = store.begin_settlement().await.unwrap();
        let status = tokio::time::timeout(Duration::from_millis(200), tx.lock_for_settlement(payment.id))
            .await
            .expect("lock should be free")
            .unwrap();
        assert_eq!(status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_transaction_until_commit() {
        let store = InMemoryPaymentStore::new();
        let payment = store.insert(new_payment("A")).await.unwrap();

        let mut holder = store.begin_settlement().await.unwrap();
        holder.lock_for_settlement(payment.id).await.unwrap();

        let contender_store = store.clone();
        let contender = tokio::spawn(async move {
            let mut tx = contender_store.begin_settlement().await.unwrap();
            let status = tx.lock_for_settlement(payment.id).await.unwrap();
            tx.commit().await.unwrap();
            status
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished(), "contender must wait for the row lock");

        holder
            .set_terminal_status(payment.id, TerminalStatus::Failed)
            .await
            .unwrap();
        holder.commit().await.unwrap();

        assert_eq!(contender.await.unwrap(), PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_set_terminal_status_requires_lock_and_pending() {
        let store = InMemoryPaymentStore::new();
        let payment = store.insert(new_payment("A")).await.unwrap();

        let mut tx = store.begin_settlement().await.unwrap();
        let err = tx
            .set_terminal_status(payment.id, TerminalStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockNotHeld(1)));

        tx.lock_for_settlement(payment.id).await.unwrap();
        tx.set_terminal_status(payment.id, TerminalStatus::Success)
            .await
            .unwrap();
        let err = tx
            .set_terminal_status(payment.id, TerminalStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyTerminal(1)));
    }

    #[tokio::test]
    async fn test_injected_commit_failure_discards_writes() {
        let store = InMemoryPaymentStore::new();
        let payment = store.insert(new_payment("A")).await.unwrap();
        store.fail_next_commits(1);

        let mut tx = store.begin_settlement().await.unwrap();
        tx.lock_for_settlement(payment.id).await.unwrap();
        tx.set_terminal_status(payment.id, TerminalStatus::Success)
            .await
            .unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Unavailable(_))));
        assert!(matches!(tx.commit().await, Err(StoreError::TransactionClosed)));

        assert_eq!(store.get(payment.id).await.unwrap().status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_lock_on_missing_payment_is_not_found() {
        let store = InMemoryPaymentStore::new();
        let mut tx = store.begin_settlement().await.unwrap();
        assert!(matches!(
            tx.lock_for_settlement(404).await,
            Err(StoreError::NotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_find_stale_pending_orders_oldest_first() {
        let store = InMemoryPaymentStore::new();
        let a = store.insert(new_payment("A")).await.unwrap();
        let b = store.insert(new_payment("B")).await.unwrap();
        let c = store.insert(new_payment("C")).await.unwrap();

        let now = Utc::now();
        store.set_created_at(a.id, now - chrono::Duration::minutes(5));
        store.set_created_at(b.id, now - chrono::Duration::minutes(10));

        let stale = store
            .find_stale_pending(now - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(stale, vec![b.id, a.id]);
        assert!(!stale.contains(&c.id));

        let limited = store
            .find_stale_pending(now - chrono::Duration::minutes(1), 1)
            .await
            .unwrap();
        assert_eq!(limited, vec![b.id]);
    }

    #[tokio::test]
    async fn test_access_counter_and_unavailable_flag() {
        let store = InMemoryPaymentStore::new();
        assert_eq!(store.access_count(), 0);

        store.set_unavailable(true);
        assert!(matches!(store.get(1).await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.access_count(), 1);
    }

    #[tokio::test]
    async fn test_row_locks_are_forgotten_once_released() {
        let store = InMemoryPaymentStore::new();
        let a = store.insert(new_payment("A")).await.unwrap();
        let b = store.insert(new_payment("B")).await.unwrap();

        let mut committed = store.begin_settlement().await.unwrap();
        committed.lock_for_settlement(a.id).await.unwrap();
        let mut dropped = store.begin_settlement().await.unwrap();
        dropped.lock_for_settlement(b.id).await.unwrap();
        assert_eq!(store.row_lock_count(), 2);

        committed.commit().await.unwrap();
        assert_eq!(store.row_lock_count(), 1);
        drop(dropped);
        assert_eq!(store.row_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_row_lock_kept_while_another_transaction_waits() {
        let store = InMemoryPaymentStore::new();
        let payment = store.insert(new_payment("A")).await.unwrap();

        let mut holder = store.begin_settlement().await.unwrap();
        holder.lock_for_settlement(payment.id).await.unwrap();

        let contender_store = store.clone();
        let contender = tokio::spawn(async move {
            let mut tx = contender_store.begin_settlement().await.unwrap();
            tx.lock_for_settlement(payment.id).await.unwrap();
            tx.rollback().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        holder.rollback().await.unwrap();
        assert_eq!(store.row_lock_count(), 1, "waiter still needs the lock");

        contender.await.unwrap();
        assert_eq!(store.row_lock_count(), 0);
    }
}
