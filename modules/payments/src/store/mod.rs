//! Payment Record Store
//!
//! `PaymentStore` is the single owner of payment state. Settlement goes
//! through a `SettlementTx`: lock the row, re-check the status under the
//! lock, write the terminal status, commit. Dropping a transaction without
//! committing rolls it back and releases the lock.
//!
//! ## Implementations
//!
//! - **PgPaymentStore**: PostgreSQL via sqlx, row locks via `SELECT ... FOR UPDATE`
//! - **InMemoryPaymentStore**: dev/test double with one async mutex per row

mod memory;
mod postgres;

pub use memory::InMemoryPaymentStore;
pub use postgres::PgPaymentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{DeadLetter, NewPayment, Payment, PaymentId, PaymentStatus, TerminalStatus};
use crate::validation::ValidationError;

/// Errors that can occur during payment store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("payment not found: {0}")]
    NotFound(PaymentId),

    #[error("reference already exists: {0}")]
    DuplicateReference(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("settlement lock not held for payment {0}")]
    LockNotHeld(PaymentId),

    #[error("payment {0} is no longer pending")]
    AlreadyTerminal(PaymentId),

    #[error("transaction already finished")]
    TransactionClosed,

    #[error("corrupt payment row: {0}")]
    CorruptRow(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Persist a new payment with status `PENDING`
    ///
    /// Assigns `id` and `created_at`. Fails with `DuplicateReference` when the
    /// reference is taken and `Validation` when the values break the table
    /// constraints. Atomic: either the whole row is visible or nothing is.
    async fn insert(&self, payment: NewPayment) -> Result<Payment, StoreError>;

    /// Point read of the current state, without locking
    async fn get(&self, id: PaymentId) -> Result<Payment, StoreError>;

    /// Open a settlement transaction
    async fn begin_settlement(&self) -> Result<Box<dyn SettlementTx>, StoreError>;

    /// Ids of payments still `PENDING` that were created before `created_before`,
    /// oldest first
    async fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentId>, StoreError>;

    /// Persist a settlement delivery that can never be resolved
    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), StoreError>;
}

/// A single settlement transaction
#[async_trait]
pub trait SettlementTx: Send {
    /// Take the exclusive row lock and return the status read under it
    ///
    /// Blocks while another transaction holds the lock on the same payment.
    /// The lock is held until `commit`, `rollback` or drop.
    async fn lock_for_settlement(&mut self, id: PaymentId) -> Result<PaymentStatus, StoreError>;

    /// Write a terminal status; requires the lock from `lock_for_settlement`
    async fn set_terminal_status(
        &mut self,
        id: PaymentId,
        status: TerminalStatus,
    ) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
