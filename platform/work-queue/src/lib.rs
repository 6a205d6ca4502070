//! # WorkQueue Abstraction
//!
//! A platform-level abstraction for durable point-to-point work distribution.
//!
//! Unlike a pub/sub bus, every message published to a queue is handed to
//! exactly one subscriber at a time, and stays owned by the queue until that
//! subscriber acknowledges it. Deliveries that are released without an ack
//! are redelivered, to the same or to another subscriber.
//!
//! ## Implementations
//!
//! - **NatsQueue**: Production implementation using NATS JetStream
//!   (work-queue retention, shared durable pull consumer, explicit acks)
//! - **InMemoryQueue**: Test/dev implementation backed by in-process FIFOs
//!
//! ## Prefetch
//!
//! `subscribe(queue, prefetch)` bounds the number of unacknowledged
//! deliveries a single subscription may hold. A subscription at its bound
//! receives nothing until it acknowledges (or drops) a delivery, which is
//! what spreads load across a fleet of consumers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use work_queue::{InMemoryQueue, WorkQueue};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = InMemoryQueue::new();
//! queue.declare("payments").await?;
//! queue.publish("payments", b"42".to_vec()).await?;
//!
//! let mut deliveries = queue.subscribe("payments", 1).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     println!("Received {} bytes", delivery.payload.len());
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod inmemory_queue;
mod nats_queue;

pub use inmemory_queue::InMemoryQueue;
pub use nats_queue::{NatsQueue, NatsQueueConfig};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Acknowledgment capability attached to a single delivery
///
/// Implementations decide what "released without ack" means for their
/// backend; the in-memory queue requeues on drop, JetStream redelivers after
/// the consumer's ack-wait expires.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> QueueResult<()>;
}

/// A message handed to one subscriber
pub struct Delivery {
    /// Queue the message was consumed from
    pub queue: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    acker: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(queue: String, payload: Vec<u8>, acker: Box<dyn AckHandle>) -> Self {
        Self {
            queue,
            payload,
            acker,
        }
    }

    /// Acknowledge the delivery, removing it from the queue for good
    ///
    /// Consumes the delivery so it cannot be acknowledged twice. Dropping a
    /// delivery without calling this leaves it eligible for redelivery.
    pub async fn ack(self) -> QueueResult<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish_non_exhaustive()
    }
}

/// Errors that can occur when using a work queue
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to declare queue: {0}")]
    DeclareError(String),

    #[error("queue not declared: {0}")]
    QueueNotFound(String),

    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to queue: {0}")]
    SubscribeError(String),

    #[error("failed to acknowledge delivery: {0}")]
    AckError(String),

    #[error("prefetch must be at least 1, got {0}")]
    InvalidPrefetch(usize),

    #[error("connection error: {0}")]
    ConnectionError(String),
}

impl QueueError {
    /// Whether retrying the same call could succeed without operator action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::PublishError(_) | QueueError::AckError(_) | QueueError::ConnectionError(_)
        )
    }
}

/// Result type for work queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Core work queue abstraction for at-least-once point-to-point delivery
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Ensure a durable queue with this name exists
    ///
    /// Idempotent: declaring an existing queue is a no-op.
    async fn declare(&self, queue: &str) -> QueueResult<()>;

    /// Durably enqueue a payload
    ///
    /// Returns once the backend has accepted the message. Fails with
    /// `QueueNotFound` (in-memory) or `PublishError` (JetStream) when the
    /// queue has not been declared.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<()>;

    /// Consume deliveries from a queue
    ///
    /// # Arguments
    /// * `queue` - A previously declared queue
    /// * `prefetch` - Maximum unacknowledged deliveries this subscription may hold (>= 1)
    ///
    /// The returned stream is lazy and unbounded; it only pulls the next
    /// message when polled and a prefetch slot is free.
    async fn subscribe(&self, queue: &str, prefetch: usize)
        -> QueueResult<BoxStream<'static, Delivery>>;
}

impl fmt::Debug for dyn WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkQueue")
    }
}
