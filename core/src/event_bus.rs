//! Event bus abstraction for spider / downloader-agent coordination.
//!
//! This module provides the [`EventBus`] trait, the whole contract the crawl
//! scheduler, the downloader agents and the statistics aggregator depend on:
//! publish an [`Event`] to a topic, register a handler for a topic, and
//! remove it again.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish    ┌─────────────────┐
//! │   Spider     │─────────────►│                 │
//! │ (scheduler)  │              │     Broker      │
//! └──────────────┘              │  (partitioned   │
//!        ▲                      │     topics)     │
//!        │ handler              │                 │
//! ┌──────┴───────┐   poll loop  │                 │
//! │ Subscription │◄─────────────│                 │
//! │   (1/topic)  │              └─────────────────┘
//! └──────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a message may be handed to a handler more than once
//! - **Idempotency**: handlers must tolerate duplicates
//! - **Ordered within partition**: no ordering across partitions or topics
//! - **One subscription per topic**: a second `subscribe` for a live topic is a no-op
//!
//! # Implementations
//!
//! - `BrokerEventBus` in `spider-bus-runtime`, generic over the broker substrate
//! - `KafkaEventBus` in `spider-bus-kafka`, the rdkafka-backed production bus

use crate::event::Event;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during event bus operations.
///
/// Only structural failures surface here. Transient receive faults and
/// handler failures are absorbed by the consumption loop and logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to construct a broker client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to create or register the consumer for a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Topic creation or partition increase failed
    #[error("Provisioning failed for topic '{topic}': {reason}")]
    ProvisioningFailed {
        /// The topic that could not be provisioned
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to encode an event
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Some consumption loops did not stop before the shutdown deadline
    #[error("Shutdown timed out; loops still running for topics {topics:?}")]
    ShutdownTimeout {
        /// Topics whose loops were still running
        topics: Vec<String>,
    },
}

/// Error type returned by subscription handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked for every event received on a subscribed topic.
///
/// The handler runs inline on the topic's consumption task: it may run
/// concurrently with handlers of other topics, never with itself. Handlers
/// should return quickly; a slow handler stalls its topic.
pub type EventHandler = Arc<dyn Fn(Event) -> Result<(), HandlerError> + Send + Sync>;

/// Wrap a closure as an [`EventHandler`].
///
/// # Examples
///
/// ```
/// use spider_bus_core::event_bus::handler;
///
/// let on_request = handler(|event| {
///     println!("received {}", event.event_type);
///     Ok(())
/// });
/// # let _ = on_request;
/// ```
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Trait for event bus implementations.
///
/// # Thread Safety
///
/// Implementations are shared as `Arc<dyn EventBus>` between the scheduler,
/// agents and statistics components, so they must be `Send + Sync`.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
/// trait stays object safe.
///
/// # Examples
///
/// ```rust,ignore
/// use spider_bus_core::event::Event;
/// use spider_bus_core::event_bus::{handler, EventBus};
///
/// bus.subscribe("agent-requests", handler(|event| {
///     download(event.data()?)?;
///     Ok(())
/// })).await?;
///
/// bus.publish("agent-requests", Some(Event::with_data("Request", &request)?)).await?;
///
/// bus.unsubscribe("agent-requests").await;
/// ```
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// Completes once the broker acknowledged the write. Passing `None` is a
    /// deliberate silent drop: nothing is written and `Ok(())` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects the
    /// write or does not acknowledge it in time, and
    /// [`EventBusError::SerializationFailed`] if the event cannot be encoded.
    fn publish(
        &self,
        topic: &str,
        event: Option<Event>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Start consuming a topic in the background, invoking `handler` for
    /// every event.
    ///
    /// Subscribing to a topic that already has a live subscription logs and
    /// returns `Ok(())` without creating anything.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ProvisioningFailed`] if a partitioned topic
    /// cannot be brought to its minimum partition count, and
    /// [`EventBusError::SubscriptionFailed`] if the consumer cannot be
    /// created or subscribed.
    fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Stop consuming a topic.
    ///
    /// No-op when the topic has no subscription. Otherwise signals the loop,
    /// releases the consumer and removes the registration, so a later
    /// `subscribe` starts cleanly.
    fn unsubscribe(&self, topic: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
