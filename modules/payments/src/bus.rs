use std::sync::Arc;
use work_queue::{InMemoryQueue, NatsQueue, QueueError, WorkQueue};

use crate::config::{BusType, Config};

/// Connect the settlement queue backend selected by `BUS_TYPE`
pub async fn connect_work_queue(config: &Config) -> Result<Arc<dyn WorkQueue>, QueueError> {
    match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory work queue");
            Ok(Arc::new(InMemoryQueue::new()))
        }
        BusType::Nats => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let client = async_nats::connect(&config.nats_url)
                .await
                .map_err(|e| QueueError::ConnectionError(e.to_string()))?;
            Ok(Arc::new(NatsQueue::new(client)))
        }
    }
}
