//! Payment settlement pipeline
//!
//! Payments are recorded as `PENDING` by the submission path, their ids are
//! queued, and a settlement worker later moves each one to `SUCCESS` or
//! `FAILED` under a row lock, acking the delivery only after the commit.

pub mod bus;
pub mod config;
pub mod db;
pub mod decider;
pub mod models;
pub mod reconciler;
pub mod routes;
pub mod shutdown;
pub mod store;
pub mod submission;
pub mod validation;
pub mod worker;

pub use decider::{FixedDecider, SettlementDecider, SimulatedDecider};
pub use models::{Currency, Payment, PaymentId, PaymentStatus, SubmitPayment, TerminalStatus};
pub use store::{InMemoryPaymentStore, PaymentStore, PgPaymentStore, SettlementTx, StoreError};
pub use submission::{SubmissionService, SubmitError};
pub use worker::{SettlementOutcome, SettlementWorker, WorkerHandle, WorkerStats, SETTLEMENT_PREFETCH};
