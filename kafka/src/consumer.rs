//! `StreamConsumer` group members behind [`BrokerConsumer`].
//!
//! Offsets are stored explicitly after each message is dispatched
//! (`enable.auto.offset.store=false`) and committed by the client's
//! auto-commit timer, so a crash between receipt and commit redelivers.

use crate::client::{base_config, broker_error};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use spider_bus_core::broker::{
    BrokerConsumer, BrokerError, BrokerFuture, ConsumerFactory, ReceivedMessage,
};
use spider_bus_core::config::ClientConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Creates one [`KafkaConsumer`] per subscription.
#[derive(Debug, Clone)]
pub struct KafkaConsumerFactory {
    client: ClientConfig,
    session_timeout: Duration,
}

impl KafkaConsumerFactory {
    /// Factory for consumers connecting with `client`.
    #[must_use]
    pub const fn new(client: ClientConfig, session_timeout: Duration) -> Self {
        Self {
            client,
            session_timeout,
        }
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn create_consumer(&self, group_id: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        let consumer: StreamConsumer = base_config(&self.client)
            .set("group.id", group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                self.session_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| BrokerError::Client(format!("Failed to create consumer: {e}")))?;

        Ok(Arc::new(KafkaConsumer {
            consumer,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A consumer-group member bound to one topic.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    closed: AtomicBool,
}

impl BrokerConsumer for KafkaConsumer {
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| broker_error(&e))
    }

    fn recv(&self, poll_interval: Duration) -> BrokerFuture<'_, Option<ReceivedMessage>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }
            match tokio::time::timeout(poll_interval, self.consumer.recv()).await {
                Err(_) => Ok(None),
                Ok(Ok(message)) => Ok(Some(ReceivedMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: message.payload().map(<[u8]>::to_vec),
                })),
                Ok(Err(e)) => Err(broker_error(&e)),
            }
        })
    }

    fn commit(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset)
            .map_err(|e| broker_error(&e))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.consumer.unsubscribe();
            tracing::debug!("Kafka consumer left its group");
        }
    }
}
