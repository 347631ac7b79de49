//! [`BrokerEventBus`]: the [`EventBus`] facade over a broker substrate.
//!
//! Wires the [`Publisher`], the [`TopicProvisioner`] and the
//! [`SubscriptionManager`] together. Any producer / consumer / admin
//! implementation can sit underneath: the Kafka crate plugs in rdkafka
//! clients, tests plug in the in-memory broker.

use crate::provision::TopicProvisioner;
use crate::publisher::Publisher;
use crate::subscription::{ConsumerOptions, SubscriptionManager, SubscriptionSnapshot};
use crate::metrics::EventBusMetrics;
use spider_bus_core::broker::{BrokerAdmin, BrokerProducer, ConsumerFactory};
use spider_bus_core::config::BusConfig;
use spider_bus_core::environment::Clock;
use spider_bus_core::event::Event;
use spider_bus_core::event_bus::{EventBus, EventBusError, EventHandler};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Timeouts and loop tunables of a [`BrokerEventBus`].
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Acknowledgment timeout for a publish
    pub publish_timeout: Duration,
    /// Timeout for metadata queries and topic administration
    pub admin_timeout: Duration,
    /// Consumption loop tunables
    pub consumer: ConsumerOptions,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            admin_timeout: Duration::from_secs(20),
            consumer: ConsumerOptions::default(),
        }
    }
}

/// Event bus over any [`BrokerProducer`] / [`ConsumerFactory`] / [`BrokerAdmin`].
///
/// One shared producer serves every publish; each subscription gets its own
/// consumer in the bus-wide consumer group.
pub struct BrokerEventBus {
    publisher: Publisher,
    provisioner: TopicProvisioner,
    subscriptions: SubscriptionManager,
}

impl BrokerEventBus {
    /// Assemble a bus from its broker clients.
    #[must_use]
    pub fn new(
        config: &BusConfig,
        producer: Arc<dyn BrokerProducer>,
        consumers: Arc<dyn ConsumerFactory>,
        admin: Arc<dyn BrokerAdmin>,
        clock: Arc<dyn Clock>,
        settings: BusSettings,
    ) -> Self {
        Self {
            publisher: Publisher::new(producer, clock, settings.publish_timeout),
            provisioner: TopicProvisioner::new(
                admin,
                config.partition_topics.clone(),
                settings.admin_timeout,
            ),
            subscriptions: SubscriptionManager::new(
                consumers,
                config.consumer_group.clone(),
                settings.consumer,
            ),
        }
    }

    /// Consumer group shared by this bus's subscriptions.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        self.subscriptions.group_id()
    }

    /// Currently registered topics, sorted.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.topics().await
    }

    /// Status snapshot of one topic's subscription.
    pub async fn subscription_status(&self, topic: &str) -> Option<SubscriptionSnapshot> {
        self.subscriptions.status(topic).await
    }

    /// Stop every subscription and wait up to `timeout` for the loops.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ShutdownTimeout`] listing the topics whose
    /// loops were still running at the deadline (they are aborted).
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EventBusError> {
        self.subscriptions.shutdown(timeout).await
    }

    async fn publish_event(&self, topic: &str, event: Option<Event>) -> Result<(), EventBusError> {
        let Some(event) = event else {
            EventBusMetrics::record_publish_dropped(topic);
            tracing::debug!(topic = %topic, "Dropping null event, nothing published");
            return Ok(());
        };
        self.publisher.publish(topic, event).await.map(|_| ())
    }

    async fn subscribe_topic(&self, topic: &str, handler: EventHandler) -> Result<(), EventBusError> {
        let mut registry = self.subscriptions.lock().await;

        if registry.is_live(topic) {
            tracing::warn!(topic = %topic, "Topic already subscribed, ignoring");
            return Ok(());
        }

        self.provisioner.ensure(topic).await?;
        registry.start(topic, handler)
    }
}

impl EventBus for BrokerEventBus {
    fn publish(
        &self,
        topic: &str,
        event: Option<Event>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move { self.publish_event(&topic, event).await })
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move { self.subscribe_topic(&topic, handler).await })
    }

    fn unsubscribe(&self, topic: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.subscriptions.unsubscribe(&topic).await;
        })
    }
}
