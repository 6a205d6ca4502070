use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashSet;

use super::{PaymentStore, SettlementTx, StoreError};
use crate::models::{DeadLetter, NewPayment, Payment, PaymentId, PaymentStatus, TerminalStatus};
use crate::validation::{validate_new_payment, ValidationError};

/// PostgreSQL-backed payment store
#[derive(Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: i32,
    amount: Decimal,
    currency: String,
    reference: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let currency = row
            .currency
            .parse()
            .map_err(|e| StoreError::CorruptRow(format!("payment {}: {}", row.id, e)))?;
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::CorruptRow(format!("payment {}: {}", row.id, e)))?;

        Ok(Payment {
            id: row.id,
            amount: row.amount,
            currency,
            reference: row.reference,
            status,
            created_at: row.created_at,
        })
    }
}

/// Translate constraint violations into domain errors
fn map_insert_error(err: sqlx::Error, reference: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::DuplicateReference(reference.to_string());
        }
        if db_err.is_check_violation() {
            return StoreError::Validation(ValidationError::ConstraintViolation(
                db_err.message().to_string(),
            ));
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        validate_new_payment(&payment)?;

        let mut tx = self.pool.begin().await?;

        // Status is never taken from the caller
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            INSERT INTO payments (amount, currency, reference, status)
            VALUES ($1, $2, $3, 'PENDING')
            RETURNING id, amount, currency, reference, status, created_at
            "#,
        )
        .bind(payment.amount)
        .bind(payment.currency.as_str())
        .bind(&payment.reference)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, &payment.reference))?;

        tx.commit().await?;

        row.try_into()
    }

    async fn get(&self, id: PaymentId) -> Result<Payment, StoreError> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            SELECT id, amount, currency, reference, status, created_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        row.try_into()
    }

    async fn begin_settlement(&self) -> Result<Box<dyn SettlementTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSettlementTx {
            tx: Some(tx),
            locked: HashSet::new(),
        }))
    }

    async fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentId>, StoreError> {
        let ids = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT id
            FROM payments
            WHERE status = 'PENDING'
              AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO failed_settlements (queue, payload, reason)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&dead_letter.queue)
        .bind(&dead_letter.payload)
        .bind(&dead_letter.reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Settlement transaction over a pooled connection
///
/// The sqlx transaction rolls back on drop, which also releases every
/// `FOR UPDATE` lock taken through it.
pub struct PgSettlementTx {
    tx: Option<Transaction<'static, Postgres>>,
    locked: HashSet<PaymentId>,
}

impl PgSettlementTx {
    fn conn(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl SettlementTx for PgSettlementTx {
    async fn lock_for_settlement(&mut self, id: PaymentId) -> Result<PaymentStatus, StoreError> {
        let tx = self.conn()?;

        let status = sqlx::query_scalar::<_, String>(
            r#"
            SELECT status
            FROM payments
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        let status = status
            .parse::<PaymentStatus>()
            .map_err(|e| StoreError::CorruptRow(format!("payment {}: {}", id, e)))?;

        self.locked.insert(id);
        Ok(status)
    }

    async fn set_terminal_status(
        &mut self,
        id: PaymentId,
        status: TerminalStatus,
    ) -> Result<(), StoreError> {
        if !self.locked.contains(&id) {
            return Err(StoreError::LockNotHeld(id));
        }

        let tx = self.conn()?;

        // The status guard keeps the transition forward-only even if a caller
        // skips the pending check
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $1
            WHERE id = $2
              AND status = 'PENDING'
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyTerminal(id));
        }

        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        self.locked.clear();
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        self.locked.clear();
        tx.rollback().await?;
        Ok(())
    }
}
