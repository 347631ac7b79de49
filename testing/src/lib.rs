//! # Spider Bus Testing
//!
//! Testing utilities for spider-bus.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: an in-memory partitioned log implementing every
//!   broker substrate trait, with fault injection
//! - Mock implementations of Environment traits ([`FixedClock`])
//! - Helpers for waiting on asynchronous conditions and recording handlers
//!
//! ## Example
//!
//! ```ignore
//! use spider_bus_testing::{InMemoryBroker, helpers::RecordingHandler, test_clock};
//! use spider_bus_runtime::{BrokerEventBus, BusSettings};
//!
//! #[tokio::test]
//! async fn test_request_flow() {
//!     let broker = InMemoryBroker::new();
//!     let bus = BrokerEventBus::new(
//!         &config,
//!         Arc::new(broker.clone()),
//!         Arc::new(broker.clone()),
//!         Arc::new(broker.clone()),
//!         Arc::new(test_clock()),
//!         BusSettings::default(),
//!     );
//!
//!     let received = RecordingHandler::new();
//!     bus.subscribe("agent-requests", received.handler()).await.unwrap();
//!     bus.publish("agent-requests", Some(event)).await.unwrap();
//!
//!     assert!(received.wait_for(1, Duration::from_secs(1)).await);
//! }
//! ```

use chrono::{DateTime, Utc};
use spider_bus_core::environment::Clock;

/// In-memory broker substrate
pub mod broker;

pub use broker::{AdminCall, InMemoryBroker, InMemoryConsumer, StoredRecord};

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making publish timestamps reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use spider_bus_testing::mocks::FixedClock;
    /// use spider_bus_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use spider_bus_core::event::Event;
    use spider_bus_core::event_bus::{EventHandler, HandlerError};
    use std::future::Future;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
    ///
    /// Returns the final value of the condition.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return condition();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Same as [`eventually`] for an asynchronous condition.
    pub async fn eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return condition().await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Handler that records every event it receives.
    ///
    /// Optionally fails or panics on events of a given type, to exercise
    /// the consumption loop's failure isolation.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingHandler {
        events: Arc<Mutex<Vec<Event>>>,
        fail_on: Option<String>,
        panic_on: Option<String>,
    }

    impl RecordingHandler {
        /// Create a handler that accepts everything.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Return an error for events whose type is `event_type`.
        #[must_use]
        pub fn failing_on(mut self, event_type: impl Into<String>) -> Self {
            self.fail_on = Some(event_type.into());
            self
        }

        /// Panic for events whose type is `event_type`.
        #[must_use]
        pub fn panicking_on(mut self, event_type: impl Into<String>) -> Self {
            self.panic_on = Some(event_type.into());
            self
        }

        /// Build the [`EventHandler`] feeding this recorder.
        #[must_use]
        pub fn handler(&self) -> EventHandler {
            let recorder = self.clone();
            Arc::new(move |event: Event| recorder.record(event))
        }

        #[allow(clippy::panic)]
        fn record(&self, event: Event) -> Result<(), HandlerError> {
            let event_type = event.event_type.clone();
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);

            if self.panic_on.as_deref() == Some(event_type.as_str()) {
                panic!("handler panicked on {event_type}");
            }
            if self.fail_on.as_deref() == Some(event_type.as_str()) {
                return Err(format!("handler rejected {event_type}").into());
            }
            Ok(())
        }

        /// Events received so far, in arrival order.
        #[must_use]
        pub fn events(&self) -> Vec<Event> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of events received so far.
        #[must_use]
        pub fn count(&self) -> usize {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        /// Wait until at least `count` events arrived.
        pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
            eventually(timeout, || self.count() >= count).await
        }
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use spider_bus_core::event::Event;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[tokio::test]
    async fn recording_handler_fails_only_on_marked_type() {
        let recorder = helpers::RecordingHandler::new().failing_on("Bad");
        let handler = recorder.handler();

        assert!(handler(Event::new("Good", vec![1])).is_ok());
        assert!(handler(Event::new("Bad", vec![2])).is_err());
        assert!(recorder.wait_for(2, Duration::from_millis(10)).await);
    }
}
