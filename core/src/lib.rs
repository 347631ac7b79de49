//! # Spider Bus Core
//!
//! Core traits and types for the spider-bus event bus, the coordination
//! backbone between crawl masters ("spiders") and downloader agents.
//!
//! ## Core Concepts
//!
//! - **Event**: the envelope every message travels in ([`event::Event`])
//! - **EventBus**: publish / subscribe / unsubscribe ([`event_bus::EventBus`])
//! - **Broker substrate**: producer, consumer and admin seams ([`broker`])
//! - **Configuration**: connection parameters and partitioned topics ([`config`])
//! - **Environment**: injected dependencies such as the [`environment::Clock`]
//!
//! ## Delivery Model
//!
//! - At-least-once delivery, ordered within a partition only
//! - One subscription per topic per process, one consumer group per process
//! - Handlers must be idempotent
//!
//! ## Example
//!
//! ```ignore
//! use spider_bus_core::event::Event;
//! use spider_bus_core::event_bus::{handler, EventBus};
//!
//! async fn wire(bus: &dyn EventBus) -> Result<(), Box<dyn std::error::Error>> {
//!     bus.subscribe("agent-responses", handler(|event| {
//!         tracing::info!(event_type = %event.event_type, "response received");
//!         Ok(())
//!     })).await?;
//!
//!     bus.publish("agent-requests", Some(Event::new("Request", vec![]))).await?;
//!     Ok(())
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Event envelope and codec
pub mod event;

/// Event bus trait and errors
pub mod event_bus;

/// Broker substrate traits
pub mod broker;

/// Connection and bus configuration
pub mod config;

/// Environment module - Injected dependencies
///
/// External dependencies the bus needs at runtime are abstracted behind
/// traits so tests can substitute deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The publisher stamps every event with `clock.now()`.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
