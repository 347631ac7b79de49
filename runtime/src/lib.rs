//! # Spider Bus Runtime
//!
//! Broker-agnostic runtime of the spider-bus event bus.
//!
//! This crate turns the broker substrate traits of `spider-bus-core` into a
//! working [`EventBus`](spider_bus_core::event_bus::EventBus): publishing,
//! topic provisioning and one background consumption loop per subscribed
//! topic.
//!
//! ## Core Components
//!
//! - **BrokerEventBus**: the facade ([`bus::BrokerEventBus`])
//! - **Publisher**: envelope encoding and acknowledged writes ([`publisher::Publisher`])
//! - **TopicProvisioner**: minimum partition counts for partitioned topics
//! - **SubscriptionManager**: registry of consumption loops, unsubscribe and shutdown
//! - **Circuit breaker / backoff**: fault handling inside the loops
//! - **Metrics**: Prometheus counters and gauges
//!
//! ## Example
//!
//! ```ignore
//! use spider_bus_runtime::{BrokerEventBus, BusSettings};
//! use spider_bus_core::event_bus::{handler, EventBus};
//!
//! let bus = BrokerEventBus::new(&config, producer, consumers, admin, clock, BusSettings::default());
//!
//! bus.subscribe("agent-requests", handler(|event| {
//!     tracing::info!(event_type = %event.event_type, "request");
//!     Ok(())
//! })).await?;
//!
//! bus.publish("agent-requests", Some(event)).await?;
//! bus.shutdown(Duration::from_secs(5)).await?;
//! ```

/// Exponential backoff between receive faults
pub mod backoff;

/// Circuit breaker pattern for broker pulls
pub mod circuit_breaker;

/// Prometheus metrics for observability
pub mod metrics;

/// Event publishing
pub mod publisher;

/// Partitioned topic provisioning
pub mod provision;

/// Subscription registry and consumption loops
pub mod subscription;

/// The event bus facade
pub mod bus;

pub use backoff::BackoffPolicy;
pub use bus::{BrokerEventBus, BusSettings};
pub use circuit_breaker::CircuitBreakerConfig;
pub use provision::{ProvisionOutcome, TopicProvisioner};
pub use publisher::Publisher;
pub use subscription::{
    ConsumerOptions, LoopExit, SubscriptionManager, SubscriptionSnapshot, SubscriptionState,
};
