//! NATS JetStream implementation of the WorkQueue trait

use crate::{AckHandle, Delivery, QueueError, QueueResult, WorkQueue};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream::{RetentionPolicy, StorageType},
};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Tuning knobs for the JetStream-backed queue
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    /// Durable consumer name shared by every subscriber of a queue
    pub consumer_name: String,
    /// How long JetStream waits for an ack before redelivering
    pub ack_wait: Duration,
    /// How long a single pull request waits for a message
    pub pull_expiry: Duration,
}

impl Default for NatsQueueConfig {
    fn default() -> Self {
        Self {
            consumer_name: "settlement-workers".to_string(),
            ack_wait: Duration::from_secs(30),
            pull_expiry: Duration::from_secs(30),
        }
    }
}

/// WorkQueue implementation using NATS JetStream
///
/// Each queue maps to one JetStream stream with `WorkQueue` retention whose
/// only subject is the queue name. All subscribers bind to the same durable
/// pull consumer, so JetStream hands each message to one of them and
/// removes it once acknowledged.
///
/// # Example
/// ```rust,no_run
/// use work_queue::{NatsQueue, WorkQueue};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let queue = NatsQueue::new(nats_client);
///
/// queue.declare("payments").await?;
/// queue.publish("payments", b"42".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsQueue {
    client: Client,
    context: jetstream::Context,
    config: NatsQueueConfig,
}

impl NatsQueue {
    /// Create a new NatsQueue from an existing NATS client
    pub fn new(client: Client) -> Self {
        Self::with_config(client, NatsQueueConfig::default())
    }

    pub fn with_config(client: Client, config: NatsQueueConfig) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            context,
            config,
        }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Stream names may not contain subject separators or wildcards
    fn stream_name(queue: &str) -> String {
        queue
            .chars()
            .map(|c| match c {
                '.' | '*' | '>' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect()
    }
}

#[async_trait]
impl WorkQueue for NatsQueue {
    async fn declare(&self, queue: &str) -> QueueResult<()> {
        let name = Self::stream_name(queue);

        self.context
            .get_or_create_stream(jetstream::stream::Config {
                name: name.clone(),
                subjects: vec![queue.to_string()],
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::DeclareError(format!("{}: {}", name, e)))?;

        tracing::debug!(queue = %queue, stream = %name, "JetStream queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<()> {
        // First await sends, second waits for the stream to persist it
        let ack = self
            .context
            .publish(queue.to_string(), payload.into())
            .await
            .map_err(|e| QueueError::PublishError(e.to_string()))?;

        ack.await
            .map_err(|e| QueueError::PublishError(e.to_string()))?;

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

        let stream = self
            .context
            .get_stream(Self::stream_name(queue))
            .await
            .map_err(|e| QueueError::QueueNotFound(format!("{}: {}", queue, e)))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &self.config.consumer_name,
                pull::Config {
                    durable_name: Some(self.config.consumer_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::SubscribeError(e.to_string()))?;

        let queue = queue.to_string();
        let pull_expiry = self.config.pull_expiry;
        let permits = Arc::new(Semaphore::new(prefetch));

        let deliveries = async_stream::stream! {
            loop {
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                // Pull one message per free prefetch slot
                let mut batch = match consumer
                    .batch()
                    .max_messages(1)
                    .expires(pull_expiry)
                    .messages()
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "JetStream pull failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let mut permit = Some(permit);
                while let Some(next) = batch.next().await {
                    match next {
                        Ok(message) => {
                            if let Some(permit) = permit.take() {
                                let payload = message.payload.to_vec();
                                let acker = NatsAck { message, _permit: permit };
                                yield Delivery::new(queue.clone(), payload, Box::new(acker));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(queue = %queue, error = %e, "JetStream delivery error");
                        }
                    }
                }
            }
        };

        Ok(deliveries.boxed())
    }
}

struct NatsAck {
    message: jetstream::Message,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl AckHandle for NatsAck {
    async fn ack(&self) -> QueueResult<()> {
        self.message
            .double_ack()
            .await
            .map_err(|e| QueueError::AckError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_sanitised() {
        assert_eq!(NatsQueue::stream_name("payments"), "PAYMENTS");
        assert_eq!(NatsQueue::stream_name("payments.settle"), "PAYMENTS_SETTLE");
        assert_eq!(NatsQueue::stream_name("a*b>c d"), "A_B_C_D");
    }

    // Note: These tests require a running NATS server with JetStream enabled
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS JetStream
    async fn test_nats_queue_publish_consume_ack() {
        let url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
        let client = async_nats::connect(&url)
            .await
            .expect("NATS server must be running");

        let queue = NatsQueue::with_config(
            client,
            NatsQueueConfig {
                consumer_name: "work-queue-test".to_string(),
                ack_wait: Duration::from_secs(2),
                pull_expiry: Duration::from_secs(2),
            },
        );

        queue.declare("work_queue_test").await.unwrap();
        queue.declare("work_queue_test").await.unwrap();
        queue
            .publish("work_queue_test", b"123".to_vec())
            .await
            .unwrap();

        let mut stream = queue.subscribe("work_queue_test", 1).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timeout waiting for delivery")
            .expect("stream ended");

        assert_eq!(delivery.payload, b"123");
        delivery.ack().await.unwrap();
    }
}
