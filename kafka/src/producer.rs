//! Shared `FutureProducer` behind [`BrokerProducer`].

use crate::client::{base_config, broker_error};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use spider_bus_core::broker::{BrokerError, BrokerFuture, BrokerProducer, Delivery, OutgoingRecord};
use spider_bus_core::config::ClientConfig;
use std::time::Duration;

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Compression codec (`none`, `gzip`, `snappy`, `lz4`, `zstd`)
    pub compression: String,
    /// Acknowledgment mode (`0`, `1`, `all`)
    pub acks: String,
    /// Local delivery timeout (`message.timeout.ms`)
    pub message_timeout: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            compression: "lz4".to_string(),
            acks: "all".to_string(),
            message_timeout: Duration::from_secs(5),
        }
    }
}

/// rdkafka producer shared by every publish of a bus.
///
/// Records are sent without a key; the `consistent_random` partitioner
/// spreads them over the partitions.
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// Create the producer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Client`] if librdkafka rejects the configuration.
    pub fn new(client: &ClientConfig, settings: &ProducerSettings) -> Result<Self, BrokerError> {
        let producer: FutureProducer = base_config(client)
            .set("partitioner", "consistent_random")
            .set("compression.type", &settings.compression)
            .set("acks", &settings.acks)
            .set(
                "message.timeout.ms",
                settings.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| BrokerError::Client(format!("Failed to create producer: {e}")))?;

        Ok(Self { producer })
    }
}

impl BrokerProducer for KafkaProducer {
    fn send(&self, record: OutgoingRecord, timeout: Duration) -> BrokerFuture<'_, Delivery> {
        Box::pin(async move {
            let kafka_record = FutureRecord::<(), [u8]>::to(&record.topic)
                .payload(&record.payload)
                .timestamp(record.timestamp_millis);

            match self.producer.send(kafka_record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => Ok(Delivery { partition, offset }),
                Err((kafka_error, _)) => Err(broker_error(&kafka_error)),
            }
        })
    }
}
