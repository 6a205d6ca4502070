//! In-memory implementation of the WorkQueue trait for testing and development

use crate::{AckHandle, Delivery, QueueError, QueueResult, WorkQueue};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// WorkQueue implementation using in-process FIFOs
///
/// This implementation is suitable for:
/// - Unit and integration tests (no external dependencies)
/// - Local development where API and worker share one process
///
/// Each declared queue is a FIFO. A message is handed to exactly one
/// subscriber; if that delivery is dropped without an ack it goes back to the
/// head of the queue and is handed out again.
///
/// # Example
/// ```rust
/// use work_queue::{InMemoryQueue, WorkQueue};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = InMemoryQueue::new();
/// queue.declare("jobs").await?;
///
/// let mut deliveries = queue.subscribe("jobs", 1).await?;
/// queue.publish("jobs", b"7".to_vec()).await?;
///
/// let delivery = deliveries.next().await.unwrap();
/// assert_eq!(delivery.payload, b"7");
/// delivery.ack().await?;
/// assert_eq!(queue.unacked_count("jobs"), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    unacked: usize,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting to be delivered (0 for unknown queues)
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state().get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages handed to a subscriber and not yet acknowledged
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().get(queue).map_or(0, |q| q.unacked)
    }

    fn state(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_next(&self, queue: &str) -> Option<Vec<u8>> {
        let mut queues = self.state();
        let state = queues.get_mut(queue)?;
        let payload = state.ready.pop_front()?;
        state.unacked += 1;
        Some(payload)
    }

    fn settle(&self, queue: &str, requeue: Option<Vec<u8>>) {
        let mut queues = self.state();
        if let Some(state) = queues.get_mut(queue) {
            state.unacked = state.unacked.saturating_sub(1);
            if let Some(payload) = requeue {
                state.ready.push_front(payload);
                state.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn declare(&self, queue: &str) -> QueueResult<()> {
        self.state().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<()> {
        let mut queues = self.state();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        state.ready.push_back(payload);
        state.notify.notify_waiters();

        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> QueueResult<BoxStream<'static, Delivery>> {
        if prefetch == 0 {
            return Err(QueueError::InvalidPrefetch(prefetch));
        }

        let notify = self
            .state()
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let this = self.clone();
        let queue = queue.to_string();
        let permits = Arc::new(Semaphore::new(prefetch));

        let stream = async_stream::stream! {
            loop {
                // Blocks while this subscription holds `prefetch` unacked deliveries
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let payload = loop {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    // Register before checking so a publish in between is not missed
                    notified.as_mut().enable();

                    if let Some(payload) = this.take_next(&queue) {
                        break payload;
                    }
                    notified.await;
                };

                let acker = InMemoryAck {
                    queue: this.clone(),
                    name: queue.clone(),
                    payload: payload.clone(),
                    acked: AtomicBool::new(false),
                    _permit: permit,
                };

                yield Delivery::new(queue.clone(), payload, Box::new(acker));
            }
        };

        Ok(stream.boxed())
    }
}

struct InMemoryAck {
    queue: InMemoryQueue,
    name: String,
    payload: Vec<u8>,
    acked: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl AckHandle for InMemoryAck {
    async fn ack(&self) -> QueueResult<()> {
        if !self.acked.swap(true, Ordering::SeqCst) {
            self.queue.settle(&self.name, None);
        }
        Ok(())
    }
}

impl Drop for InMemoryAck {
    fn drop(&mut self) {
        if !self.acked.load(Ordering::SeqCst) {
            tracing::debug!(queue = %self.name, "Delivery released without ack, requeueing");
            self.queue
                .settle(&self.name, Some(std::mem::take(&mut self.payload)));
        }
    }
}
