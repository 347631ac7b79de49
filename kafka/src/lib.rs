//! Kafka event bus for spider-bus.
//!
//! This crate provides the production [`KafkaEventBus`], implementing the
//! [`EventBus`] trait from `spider-bus-core` on top of rdkafka. It plugs
//! rdkafka producer, consumer and admin clients into the broker-agnostic
//! [`BrokerEventBus`] runtime.
//!
//! # Why Kafka?
//!
//! - **Partitioned topics**: downloader agents of one group share a topic's partitions
//! - **Consumer groups**: every process of a deployment joins the same group
//! - **Retention**: a group created later still reads from the earliest retained offset
//! - **Kafka-compatible**: works against Apache Kafka, Redpanda, MSK and friends
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  publish   ┌───────────────┐  FutureProducer   ┌─────────┐
//! │   Spider     │───────────►│               │──────────────────►│         │
//! └──────────────┘            │  KafkaEventBus│                   │  Kafka  │
//! ┌──────────────┐  handler   │  (1 loop per  │  StreamConsumer   │         │
//! │   Agent      │◄───────────│     topic)    │◄──────────────────│         │
//! └──────────────┘            └───────┬───────┘                   └────▲────┘
//!                                     │ AdminClient (provisioning)     │
//!                                     └────────────────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery**:
//! - Offsets are stored after the handler ran and committed by auto-commit
//! - If the process crashes before commit, events are redelivered
//! - Handlers MUST be idempotent
//! - Ordering is guaranteed within a partition only; records carry no key
//!
//! # Example
//!
//! ```no_run
//! use spider_bus_kafka::KafkaEventBus;
//! use spider_bus_core::event::Event;
//! use spider_bus_core::event_bus::{handler, EventBus};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = KafkaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("crawler")
//!     .partition_topic("agent-requests", 8)
//!     .build()?;
//!
//! bus.subscribe("agent-requests", handler(|event| {
//!     println!("received {}", event.event_type);
//!     Ok(())
//! })).await?;
//!
//! bus.publish("agent-requests", Some(Event::new("Request", vec![1, 2, 3]))).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// librdkafka configuration and error mapping
pub mod client;

/// Producer adapter
pub mod producer;

/// Consumer adapter
pub mod consumer;

/// Admin adapter
pub mod admin;

use admin::KafkaAdmin;
use consumer::KafkaConsumerFactory;
use producer::{KafkaProducer, ProducerSettings};
use spider_bus_core::config::{BusConfig, ClientConfig, SecurityProtocol};
use spider_bus_core::environment::{Clock, SystemClock};
use spider_bus_core::event::Event;
use spider_bus_core::event_bus::{EventBus, EventBusError, EventHandler};
use spider_bus_runtime::{BrokerEventBus, BusSettings, ConsumerOptions, SubscriptionSnapshot};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Kafka event bus implementation.
///
/// One shared producer serves every publish; each subscribed topic gets its
/// own consumer in the configured consumer group and its own background
/// consumption loop. Partitioned topics are created or grown to their
/// minimum partition count before their first subscription.
///
/// # Configuration
///
/// - **Brokers**: bootstrap servers (required)
/// - **Security**: protocol plus optional SASL mechanism and credentials
/// - **Consumer group**: shared by all subscriptions of the process
/// - **Partitioned topics**: topic → minimum partition count
/// - **Producer**: compression (default `lz4`), acks, publish timeout
/// - **Consumption loops**: poll interval, backoff, circuit breaker
///
/// # Example
///
/// ```no_run
/// use spider_bus_kafka::KafkaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let bus = KafkaEventBus::new("localhost:9092")?;
///
/// // Custom configuration
/// let bus = KafkaEventBus::builder()
///     .brokers("broker-1:9092,broker-2:9092")
///     .sasl("SCRAM-SHA-512", "spider", "secret")
///     .consumer_group("crawler")
///     .compression("zstd")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaEventBus {
    inner: BrokerEventBus,
    brokers: String,
}

impl KafkaEventBus {
    /// Create a Kafka event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if a client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a Kafka event bus from a loaded [`BusConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if a client cannot be created.
    pub fn from_config(config: BusConfig) -> Result<Self, EventBusError> {
        Self::builder().config(config).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> KafkaEventBusBuilder {
        KafkaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group of this bus's subscriptions.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        self.inner.consumer_group()
    }

    /// Currently registered topics, sorted.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions().await
    }

    /// Status snapshot of one topic's subscription.
    pub async fn subscription_status(&self, topic: &str) -> Option<SubscriptionSnapshot> {
        self.inner.subscription_status(topic).await
    }

    /// Stop every subscription, waiting up to `timeout` for the loops.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ShutdownTimeout`] naming topics whose loops
    /// did not stop in time.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EventBusError> {
        self.inner.shutdown(timeout).await
    }
}

/// Builder for configuring a [`KafkaEventBus`].
///
/// # Example
///
/// ```no_run
/// use spider_bus_kafka::KafkaEventBus;
/// use spider_bus_runtime::ConsumerOptions;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = KafkaEventBus::builder()
///     .brokers("localhost:9092")
///     .consumer_group("statistics")
///     .publish_timeout(Duration::from_secs(10))
///     .consumer_options(ConsumerOptions::default().with_poll_interval(Duration::from_millis(500)))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct KafkaEventBusBuilder {
    config: Option<BusConfig>,
    brokers: Option<String>,
    security_protocol: Option<SecurityProtocol>,
    sasl: Option<(String, String, String)>,
    consumer_group: Option<String>,
    partition_topics: HashMap<String, usize>,
    compression: Option<String>,
    producer_acks: Option<String>,
    publish_timeout: Option<Duration>,
    admin_timeout: Option<Duration>,
    session_timeout: Option<Duration>,
    consumer_options: Option<ConsumerOptions>,
    clock: Option<Arc<dyn Clock>>,
}

impl KafkaEventBusBuilder {
    /// Start from a loaded configuration; later builder calls override it.
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the security protocol.
    #[must_use]
    pub const fn security_protocol(mut self, protocol: SecurityProtocol) -> Self {
        self.security_protocol = Some(protocol);
        self
    }

    /// Set the SASL mechanism and credentials.
    #[must_use]
    pub fn sasl(
        mut self,
        mechanism: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.sasl = Some((mechanism.into(), username.into(), password.into()));
        self
    }

    /// Set the consumer group ID shared by every subscription.
    ///
    /// Default: `spider-bus`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Flag `topic` as partitioned with at least `min_partitions` partitions.
    #[must_use]
    pub fn partition_topic(mut self, topic: impl Into<String>, min_partitions: usize) -> Self {
        self.partition_topics.insert(topic.into(), min_partitions);
        self
    }

    /// Set the compression codec.
    ///
    /// # Parameters
    ///
    /// - `compression`: "none", "gzip", "snappy", "lz4", "zstd"
    ///
    /// Default: "lz4"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the publish acknowledgment timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = Some(timeout);
        self
    }

    /// Set the timeout for metadata and topic administration.
    ///
    /// Default: 20 seconds
    #[must_use]
    pub const fn admin_timeout(mut self, timeout: Duration) -> Self {
        self.admin_timeout = Some(timeout);
        self
    }

    /// Set the consumer group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set the consumption loop tunables.
    #[must_use]
    pub fn consumer_options(mut self, options: ConsumerOptions) -> Self {
        self.consumer_options = Some(options);
        self
    }

    /// Replace the clock used for publish timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn bus_config(&mut self) -> Result<BusConfig, EventBusError> {
        let mut config = match self.config.take() {
            Some(config) => config,
            None => {
                let brokers = self.brokers.take().ok_or_else(|| {
                    EventBusError::ConnectionFailed("Brokers not configured".to_string())
                })?;
                BusConfig::new(ClientConfig::new(brokers), "spider-bus")
            }
        };

        if let Some(brokers) = self.brokers.take() {
            config.client.brokers = brokers;
        }
        if let Some(protocol) = self.security_protocol {
            config.client.security_protocol = protocol;
        }
        if let Some((mechanism, username, password)) = self.sasl.take() {
            config.client = config.client.with_sasl(mechanism, username, password);
        }
        if let Some(group) = self.consumer_group.take() {
            config.consumer_group = group;
        }
        config.partition_topics.extend(self.partition_topics.drain());
        Ok(config)
    }

    /// Build the [`KafkaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - A producer, consumer or admin client cannot be created
    /// - Invalid configuration
    pub fn build(mut self) -> Result<KafkaEventBus, EventBusError> {
        let config = self.bus_config()?;
        let defaults = BusSettings::default();
        let settings = BusSettings {
            publish_timeout: self.publish_timeout.unwrap_or(defaults.publish_timeout),
            admin_timeout: self.admin_timeout.unwrap_or(defaults.admin_timeout),
            consumer: self.consumer_options.unwrap_or(defaults.consumer),
        };
        let producer_defaults = ProducerSettings::default();
        let producer_settings = ProducerSettings {
            compression: self.compression.unwrap_or(producer_defaults.compression),
            acks: self.producer_acks.unwrap_or(producer_defaults.acks),
            message_timeout: settings.publish_timeout,
        };

        let producer = KafkaProducer::new(&config.client, &producer_settings)
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        let admin = KafkaAdmin::new(&config.client)
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        let consumers = KafkaConsumerFactory::new(
            config.client.clone(),
            self.session_timeout.unwrap_or(Duration::from_secs(6)),
        );

        tracing::info!(
            brokers = %config.client.brokers,
            security_protocol = %config.client.security_protocol,
            consumer_group = %config.consumer_group,
            partition_topics = ?config.partition_topics,
            compression = %producer_settings.compression,
            acks = %producer_settings.acks,
            "KafkaEventBus created successfully"
        );

        let inner = BrokerEventBus::new(
            &config,
            Arc::new(producer),
            Arc::new(consumers),
            Arc::new(admin),
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            settings,
        );

        Ok(KafkaEventBus {
            inner,
            brokers: config.client.brokers,
        })
    }
}

impl EventBus for KafkaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: Option<Event>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        self.inner.publish(topic, event)
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        self.inner.subscribe(topic, handler)
    }

    fn unsubscribe(&self, topic: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.inner.unsubscribe(topic)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kafka_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaEventBus>();
        assert_sync::<KafkaEventBus>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = KafkaEventBus::builder().build();
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }

    #[test]
    fn builder_overrides_loaded_config() {
        let loaded = BusConfig::new(ClientConfig::new("from-env:9092"), "from-env")
            .with_partition_topic("agent-requests", 4);
        let mut builder = KafkaEventBus::builder()
            .config(loaded)
            .consumer_group("crawler")
            .partition_topic("agent-responses", 2)
            .security_protocol(SecurityProtocol::SaslSsl)
            .sasl("PLAIN", "spider", "secret");

        let config = builder.bus_config().unwrap();

        assert_eq!(config.client.brokers, "from-env:9092");
        assert_eq!(config.consumer_group, "crawler");
        assert_eq!(config.min_partitions("agent-requests"), Some(4));
        assert_eq!(config.min_partitions("agent-responses"), Some(2));
        assert_eq!(config.client.security_protocol, SecurityProtocol::SaslSsl);
        assert_eq!(config.client.sasl_username.as_deref(), Some("spider"));
    }

    #[test]
    fn builder_uses_default_group() {
        let config = KafkaEventBus::builder()
            .brokers("localhost:9092")
            .bus_config()
            .unwrap();
        assert_eq!(config.consumer_group, "spider-bus");
    }
}
