//! Publisher: turns an [`Event`] into an acknowledged broker write.

use crate::metrics::EventBusMetrics;
use spider_bus_core::broker::{BrokerProducer, Delivery, OutgoingRecord};
use spider_bus_core::environment::Clock;
use spider_bus_core::event::Event;
use spider_bus_core::event_bus::EventBusError;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Serializes events and writes them through the shared producer.
///
/// Records carry no key; the producer's partitioner spreads them across
/// partitions. The envelope timestamp is always the publish time taken from
/// the injected [`Clock`].
#[derive(Clone)]
pub struct Publisher {
    producer: Arc<dyn BrokerProducer>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Publisher {
    /// Create a publisher over a shared producer.
    #[must_use]
    pub fn new(producer: Arc<dyn BrokerProducer>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            producer,
            clock,
            timeout,
        }
    }

    /// Stamp, encode and send `event`, waiting for the broker acknowledgment.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::SerializationFailed`] if the envelope cannot be encoded
    /// - [`EventBusError::PublishFailed`] if the broker rejects the write or
    ///   does not acknowledge it within the timeout
    pub async fn publish(&self, topic: &str, mut event: Event) -> Result<Delivery, EventBusError> {
        event.timestamp_millis = self.clock.now().timestamp_millis();

        let payload = event
            .encode()
            .map_err(|e| EventBusError::SerializationFailed(e.to_string()))?;

        let record = OutgoingRecord {
            topic: topic.to_string(),
            payload,
            timestamp_millis: event.timestamp_millis,
        };

        let started = Instant::now();
        match self.producer.send(record, self.timeout).await {
            Ok(delivery) => {
                EventBusMetrics::record_publish(topic, started.elapsed());
                tracing::debug!(
                    topic = %topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    event_type = %event.event_type,
                    "Event published successfully"
                );
                Ok(delivery)
            }
            Err(error) => {
                EventBusMetrics::record_publish_error(topic);
                tracing::error!(
                    topic = %topic,
                    event_type = %event.event_type,
                    error = %error,
                    "Failed to publish event"
                );
                Err(EventBusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: error.to_string(),
                })
            }
        }
    }
}
