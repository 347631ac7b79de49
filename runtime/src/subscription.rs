//! Subscription registry and per-topic consumption loops.
//!
//! The [`SubscriptionManager`] owns every running loop of the process. The
//! registry (topic → [`Subscription`]) lives behind one `tokio::sync::Mutex`;
//! subscribe and unsubscribe run entirely inside it, so a topic can never be
//! registered or removed twice concurrently.
//!
//! # Loop Lifecycle
//!
//! ```text
//!  Starting ──► Active ──► Stopping ──► Stopped
//!                 │  ▲
//!                 ▼  │  pull / decode / handle
//!               (iteration)
//! ```
//!
//! Every iteration of an active loop:
//!
//! 1. exits if its registry membership flag was cleared or cancellation was signalled
//! 2. asks the circuit breaker whether it may pull (an open circuit sleeps out its cooldown)
//! 3. pulls one message, bounded by the poll interval and raced against cancellation
//! 4. decodes and hands the event to the handler; handler errors and panics are logged
//!    and never end the loop
//! 5. on a receive fault, records it with the breaker and backs off exponentially
//!
//! The loop reads only its membership flag, never the registry lock. It may
//! run one extra iteration after removal; unsubscribe also signals
//! cancellation directly, which interrupts a pending pull.
//!
//! # Reconnect Policy
//!
//! The broker client reconnects on its own. The loop keeps pulling under
//! backoff and the breaker; after `max_failed_recoveries` consecutive failed
//! half-open trials it gives up, logs at error level and stops with
//! [`LoopExit::RecoveryExhausted`]. A later `subscribe` replaces the dead
//! registration.

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::{
    Admission, CircuitBreakerConfig, PollCircuitBreaker, State as CircuitState, Transition,
};
use crate::metrics::{CircuitBreakerMetrics, EventBusMetrics};
use spider_bus_core::broker::{BrokerConsumer, ConsumerFactory, ReceivedMessage};
use spider_bus_core::event::Event;
use spider_bus_core::event_bus::{EventBusError, EventHandler};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tunables for consumption loops.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Upper bound for a single pull
    pub poll_interval: Duration,
    /// Delay schedule between consecutive receive faults while the circuit is closed
    pub backoff: BackoffPolicy,
    /// Breaker thresholds and cooldowns
    pub circuit_breaker: CircuitBreakerConfig,
    /// Failed half-open trials before a loop gives up; `None` retries forever
    pub max_failed_recoveries: Option<u32>,
    /// How long unsubscribe waits for a loop to finish
    pub join_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_failed_recoveries: Some(10),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl ConsumerOptions {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the circuit breaker configuration.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Set how many failed recovery trials end a loop (`None` = never).
    #[must_use]
    pub const fn with_max_failed_recoveries(mut self, max: Option<u32>) -> Self {
        self.max_failed_recoveries = max;
        self
    }

    /// Set the unsubscribe join timeout.
    #[must_use]
    pub const fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, loop not yet polling
    Starting,
    /// Loop polling
    Active,
    /// Loop leaving, consumer being released
    Stopping,
    /// Loop finished
    Stopped,
}

impl SubscriptionState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Active => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Active,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Why a consumption loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Cancellation was signalled by unsubscribe or shutdown
    Cancelled,
    /// The registry entry was removed
    Removed,
    /// The broker stayed unreachable through too many recovery trials
    RecoveryExhausted {
        /// Failed half-open trials
        failed_trials: u32,
    },
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    /// Subscribed topic
    pub topic: String,
    /// Lifecycle state
    pub state: SubscriptionState,
    /// Circuit breaker state of the loop
    pub circuit: CircuitState,
    /// Completed pulls (with or without a message)
    pub polls: u64,
    /// Events handled successfully
    pub messages_handled: u64,
    /// Handler invocations that failed or panicked
    pub handler_failures: u64,
    /// Messages pulled without payload
    pub empty_payloads: u64,
    /// Payloads that failed to decode
    pub decode_failures: u64,
    /// Broker faults while pulling
    pub receive_faults: u64,
    /// Exit reason once the loop has stopped
    pub exit: Option<LoopExit>,
}

/// Counters shared between a loop and the registry.
#[derive(Debug, Default)]
struct SubscriptionStatus {
    state: AtomicU8,
    circuit: AtomicU8,
    polls: AtomicU64,
    handled: AtomicU64,
    handler_failures: AtomicU64,
    empty_payloads: AtomicU64,
    decode_failures: AtomicU64,
    receive_faults: AtomicU64,
    exit: OnceLock<LoopExit>,
}

impl SubscriptionStatus {
    fn set_state(&self, state: SubscriptionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_circuit(&self, topic: &str, circuit: CircuitState) {
        let previous = self.circuit.swap(circuit.as_u8(), Ordering::AcqRel);
        if previous != circuit.as_u8() {
            CircuitBreakerMetrics::record_state(topic, circuit);
        }
    }

    fn finish(&self, exit: LoopExit) {
        let _ = self.exit.set(exit);
        self.set_state(SubscriptionState::Stopped);
    }

    fn snapshot(&self, topic: &str) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            topic: topic.to_string(),
            state: self.state(),
            circuit: CircuitState::from_u8(self.circuit.load(Ordering::Acquire)),
            polls: self.polls.load(Ordering::Relaxed),
            messages_handled: self.handled.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            empty_payloads: self.empty_payloads.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            receive_faults: self.receive_faults.load(Ordering::Relaxed),
            exit: self.exit.get().copied(),
        }
    }
}

/// A registered topic subscription and the handle of its loop.
struct Subscription {
    active: Arc<AtomicBool>,
    cancel: watch::Sender<bool>,
    consumer: Arc<dyn BrokerConsumer>,
    status: Arc<SubscriptionStatus>,
    task: JoinHandle<LoopExit>,
}

impl Subscription {
    fn is_running(&self) -> bool {
        self.status.exit.get().is_none() && !self.task.is_finished()
    }

    /// Signal the loop, release the consumer and join the task.
    ///
    /// Returns `false` if the loop did not finish within `join_timeout`; the
    /// task is aborted in that case.
    async fn stop(self, topic: &str, join_timeout: Duration) -> bool {
        self.active.store(false, Ordering::Release);
        if self.status.state() != SubscriptionState::Stopped {
            self.status.set_state(SubscriptionState::Stopping);
        }
        let _ = self.cancel.send(true);
        self.consumer.close();

        let mut task = self.task;
        match tokio::time::timeout(join_timeout, &mut task).await {
            Ok(Ok(exit)) => {
                tracing::info!(topic = %topic, exit = ?exit, "Unsubscribed from topic");
                true
            }
            Ok(Err(join_error)) => {
                tracing::error!(
                    topic = %topic,
                    error = %join_error,
                    "Consumption loop terminated abnormally"
                );
                self.status.set_state(SubscriptionState::Stopped);
                true
            }
            Err(_) => {
                tracing::warn!(
                    topic = %topic,
                    timeout_ms = join_timeout.as_millis(),
                    "Consumption loop did not stop in time, aborting"
                );
                task.abort();
                self.status.set_state(SubscriptionState::Stopped);
                false
            }
        }
    }
}

/// Owns the registry of per-topic consumption loops.
pub struct SubscriptionManager {
    consumers: Arc<dyn ConsumerFactory>,
    group_id: String,
    options: ConsumerOptions,
    registry: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionManager {
    /// Create a manager whose consumers all join `group_id`.
    #[must_use]
    pub fn new(
        consumers: Arc<dyn ConsumerFactory>,
        group_id: impl Into<String>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            consumers,
            group_id: group_id.into(),
            options,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Consumer group shared by every subscription.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Acquire the registry for a subscribe or unsubscribe critical section.
    pub async fn lock(&self) -> Registry<'_> {
        Registry {
            manager: self,
            entries: self.registry.lock().await,
        }
    }

    /// Stop and remove the loop for `topic`, if any.
    ///
    /// Returns `true` if a subscription existed.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        self.lock().await.stop(topic).await
    }

    /// Topics with a registry entry, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.registry.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Snapshot of the subscription for `topic`.
    pub async fn status(&self, topic: &str) -> Option<SubscriptionSnapshot> {
        self.registry
            .lock()
            .await
            .get(topic)
            .map(|subscription| subscription.status.snapshot(topic))
    }

    /// Stop every subscription, joining all loops concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ShutdownTimeout`] naming the topics whose
    /// loops did not finish within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EventBusError> {
        let mut entries = self.registry.lock().await;
        let drained: Vec<(String, Subscription)> = entries.drain().collect();
        EventBusMetrics::record_active_subscriptions(0);

        tracing::info!(subscriptions = drained.len(), "Stopping all subscriptions");

        let results = futures::future::join_all(drained.into_iter().map(
            |(topic, subscription)| async move {
                let stopped = subscription.stop(&topic, timeout).await;
                (topic, stopped)
            },
        ))
        .await;

        let mut stragglers: Vec<String> = results
            .into_iter()
            .filter_map(|(topic, stopped)| (!stopped).then_some(topic))
            .collect();

        if stragglers.is_empty() {
            tracing::info!("All consumption loops stopped");
            Ok(())
        } else {
            stragglers.sort();
            tracing::error!(topics = ?stragglers, "Shutdown timeout: consumption loops still running");
            Err(EventBusError::ShutdownTimeout { topics: stragglers })
        }
    }
}

/// Exclusive access to the subscription registry.
///
/// Held for the whole of a subscribe (including provisioning) or unsubscribe.
pub struct Registry<'a> {
    manager: &'a SubscriptionManager,
    entries: MutexGuard<'a, HashMap<String, Subscription>>,
}

impl Registry<'_> {
    /// Whether `topic` has a subscription whose loop is still running.
    ///
    /// Entries whose loop ended on its own are removed here.
    pub fn is_live(&mut self, topic: &str) -> bool {
        match self.entries.get(topic) {
            Some(subscription) if subscription.is_running() => true,
            Some(_) => {
                if let Some(dead) = self.entries.remove(topic) {
                    tracing::info!(
                        topic = %topic,
                        exit = ?dead.status.exit.get(),
                        "Removing stopped subscription"
                    );
                    dead.consumer.close();
                }
                EventBusMetrics::record_active_subscriptions(self.entries.len());
                false
            }
            None => false,
        }
    }

    /// Create the consumer for `topic` and launch its loop.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the consumer cannot
    /// be created or subscribed; nothing is registered in that case.
    pub fn start(&mut self, topic: &str, handler: EventHandler) -> Result<(), EventBusError> {
        let manager = self.manager;

        let consumer = manager
            .consumers
            .create_consumer(&manager.group_id)
            .map_err(|e| EventBusError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        if let Err(e) = consumer.subscribe(topic) {
            consumer.close();
            return Err(EventBusError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: format!("Failed to subscribe to topic: {e}"),
            });
        }

        let status = Arc::new(SubscriptionStatus::default());
        let active = Arc::new(AtomicBool::new(true));
        let (cancel, cancel_rx) = watch::channel(false);

        let consumption = ConsumptionLoop {
            topic: topic.to_string(),
            consumer: Arc::clone(&consumer),
            handler,
            active: Arc::clone(&active),
            cancel: cancel_rx,
            status: Arc::clone(&status),
            options: manager.options.clone(),
        };
        let task = tokio::spawn(consumption.run());

        self.entries.insert(
            topic.to_string(),
            Subscription {
                active,
                cancel,
                consumer,
                status,
                task,
            },
        );
        EventBusMetrics::record_active_subscriptions(self.entries.len());

        tracing::info!(
            topic = %topic,
            consumer_group = %manager.group_id,
            poll_interval_ms = manager.options.poll_interval.as_millis(),
            "Subscribed to topic"
        );
        Ok(())
    }

    /// Stop and remove the subscription for `topic`.
    ///
    /// Returns `false` (and does nothing) if the topic is not registered.
    pub async fn stop(&mut self, topic: &str) -> bool {
        let Some(subscription) = self.entries.remove(topic) else {
            tracing::debug!(topic = %topic, "Unsubscribe ignored: topic not subscribed");
            return false;
        };
        EventBusMetrics::record_active_subscriptions(self.entries.len());
        subscription
            .stop(topic, self.manager.options.join_timeout)
            .await;
        true
    }
}

/// State owned by one topic's background task.
struct ConsumptionLoop {
    topic: String,
    consumer: Arc<dyn BrokerConsumer>,
    handler: EventHandler,
    active: Arc<AtomicBool>,
    cancel: watch::Receiver<bool>,
    status: Arc<SubscriptionStatus>,
    options: ConsumerOptions,
}

impl ConsumptionLoop {
    async fn run(mut self) -> LoopExit {
        tracing::info!(topic = %self.topic, "Consumption loop started");
        self.status.set_state(SubscriptionState::Active);

        let mut breaker =
            PollCircuitBreaker::new(self.options.circuit_breaker.clone()).for_topic(&self.topic);
        let exit = self.poll_until_exit(&mut breaker).await;

        self.status.set_state(SubscriptionState::Stopping);
        self.consumer.close();
        self.status.finish(exit);

        match exit {
            LoopExit::Cancelled => {
                tracing::info!(topic = %self.topic, "Consumption loop cancelled");
            }
            LoopExit::Removed => {
                tracing::info!(topic = %self.topic, "Consumption loop left: subscription removed");
            }
            LoopExit::RecoveryExhausted { failed_trials } => {
                tracing::error!(
                    topic = %self.topic,
                    failed_trials,
                    "Consumption loop stopped: broker unreachable after repeated recovery attempts"
                );
            }
        }
        exit
    }

    async fn poll_until_exit(&mut self, breaker: &mut PollCircuitBreaker) -> LoopExit {
        loop {
            if !self.active.load(Ordering::Acquire) {
                return LoopExit::Removed;
            }
            if *self.cancel.borrow() {
                return LoopExit::Cancelled;
            }

            let admission = breaker.admit(Instant::now());
            self.status.set_circuit(&self.topic, breaker.state());
            if let Admission::Wait(remaining) = admission {
                if self.sleep_or_cancel(remaining).await {
                    return LoopExit::Cancelled;
                }
                continue;
            }

            let received = tokio::select! {
                biased;
                _ = self.cancel.changed() => return LoopExit::Cancelled,
                result = self.consumer.recv(self.options.poll_interval) => result,
            };
            self.status.polls.fetch_add(1, Ordering::Relaxed);

            match received {
                Ok(message) => {
                    if breaker.record_success() == Some(Transition::Closed) {
                        tracing::info!(topic = %self.topic, "Broker reachable again, resuming consumption");
                    }
                    self.status.set_circuit(&self.topic, breaker.state());
                    if let Some(message) = message {
                        self.dispatch(&message);
                    }
                }
                Err(fault) => {
                    self.status.receive_faults.fetch_add(1, Ordering::Relaxed);
                    EventBusMetrics::record_receive_fault(&self.topic);
                    tracing::warn!(
                        topic = %self.topic,
                        error = %fault,
                        consecutive_faults = breaker.consecutive_failures() + 1,
                        "Failed to receive message"
                    );

                    let transition = breaker.record_failure(Instant::now());
                    self.status.set_circuit(&self.topic, breaker.state());

                    if let Some(Transition::Reopened { failed_trials, .. }) = transition {
                        if self
                            .options
                            .max_failed_recoveries
                            .is_some_and(|max| failed_trials >= max)
                        {
                            return LoopExit::RecoveryExhausted { failed_trials };
                        }
                    }

                    if breaker.state() == CircuitState::Closed {
                        let delay = self
                            .options
                            .backoff
                            .delay_for_attempt(breaker.consecutive_failures().saturating_sub(1));
                        if self.sleep_or_cancel(delay).await {
                            return LoopExit::Cancelled;
                        }
                    }
                }
            }
        }
    }

    /// Sleep for `duration`; returns `true` if cancelled meanwhile.
    async fn sleep_or_cancel(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.changed() => true,
            () = tokio::time::sleep(duration) => false,
        }
    }

    fn dispatch(&self, message: &ReceivedMessage) {
        match message.payload.as_deref() {
            None | Some([]) => {
                self.status.empty_payloads.fetch_add(1, Ordering::Relaxed);
                EventBusMetrics::record_empty_payload(&self.topic);
                tracing::warn!(
                    topic = %self.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Received message without payload"
                );
            }
            Some(bytes) => match Event::decode(bytes) {
                Ok(event) => self.invoke_handler(event, message),
                Err(e) => {
                    self.status.decode_failures.fetch_add(1, Ordering::Relaxed);
                    EventBusMetrics::record_decode_failure(&self.topic);
                    tracing::error!(
                        topic = %self.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Failed to decode event"
                    );
                }
            },
        }

        if let Err(e) = self.consumer.commit(message) {
            tracing::warn!(
                topic = %self.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to store offset (message may be redelivered)"
            );
        }
    }

    fn invoke_handler(&self, event: Event, message: &ReceivedMessage) {
        let event_type = event.event_type.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.handler)(event)));

        match outcome {
            Ok(Ok(())) => {
                self.status.handled.fetch_add(1, Ordering::Relaxed);
                EventBusMetrics::record_consume(&self.topic);
                tracing::trace!(
                    topic = %self.topic,
                    partition = message.partition,
                    offset = message.offset,
                    event_type = %event_type,
                    "Event handled"
                );
            }
            Ok(Err(error)) => {
                self.status.handler_failures.fetch_add(1, Ordering::Relaxed);
                EventBusMetrics::record_handler_failure(&self.topic);
                tracing::error!(
                    topic = %self.topic,
                    offset = message.offset,
                    event_type = %event_type,
                    error = %error,
                    "Handler failed to process event"
                );
            }
            Err(panic) => {
                self.status.handler_failures.fetch_add(1, Ordering::Relaxed);
                EventBusMetrics::record_handler_failure(&self.topic);
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    topic = %self.topic,
                    offset = message.offset,
                    event_type = %event_type,
                    panic = %reason,
                    "Handler panicked while processing event"
                );
            }
        }
    }
}
