//! Behavioral tests for `BrokerEventBus` against the in-memory broker.
//!
//! Covers publish/subscribe delivery, duplicate and unknown-topic handling,
//! failure isolation inside the consumption loop, the circuit breaker under
//! broker outages, recovery exhaustion and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use serde::{Deserialize, Serialize};
use spider_bus_core::broker::{BrokerConsumer, ConsumerFactory};
use spider_bus_core::config::{BusConfig, ClientConfig};
use spider_bus_core::environment::Clock;
use spider_bus_core::event::Event;
use spider_bus_core::event_bus::{EventBus, EventBusError, handler};
use spider_bus_runtime::circuit_breaker::{CircuitBreakerConfig, State as CircuitState};
use spider_bus_runtime::{
    BackoffPolicy, BrokerEventBus, BusSettings, ConsumerOptions, LoopExit, SubscriptionSnapshot,
    SubscriptionState,
};
use spider_bus_testing::helpers::{RecordingHandler, eventually};
use spider_bus_testing::{InMemoryBroker, test_clock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    x: String,
}

fn fast_options() -> ConsumerOptions {
    ConsumerOptions::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_backoff(
            BackoffPolicy::builder()
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(20))
                .build(),
        )
        .with_circuit_breaker(
            CircuitBreakerConfig::builder()
                .failure_threshold(3)
                .cooldown(Duration::from_secs(10))
                .build(),
        )
        .with_join_timeout(Duration::from_secs(1))
}

fn bus_with(broker: &InMemoryBroker, config: &BusConfig, options: ConsumerOptions) -> BrokerEventBus {
    BrokerEventBus::new(
        config,
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        Arc::new(test_clock()),
        BusSettings {
            consumer: options,
            ..BusSettings::default()
        },
    )
}

fn bus(broker: &InMemoryBroker, group: &str) -> BrokerEventBus {
    bus_with(
        broker,
        &BusConfig::new(ClientConfig::default(), group),
        fast_options(),
    )
}

async fn wait_for_status<F>(bus: &BrokerEventBus, topic: &str, predicate: F) -> SubscriptionSnapshot
where
    F: Fn(&SubscriptionSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = bus.subscription_status(topic).await;
        if let Some(snapshot) = snapshot {
            if predicate(&snapshot) || tokio::time::Instant::now() >= deadline {
                return snapshot;
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("no subscription for {topic}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn test_publish_none_writes_nothing() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");

    let result = bus.publish("agent-requests", None).await;

    assert_eq!(result, Ok(()));
    assert_eq!(broker.record_count("agent-requests"), 0);
    assert_eq!(broker.partitions("agent-requests"), 0);
}

#[tokio::test]
async fn test_publish_overwrites_timestamp_with_clock() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    let mut event = Event::new("Request", vec![1, 2, 3]);
    event.timestamp_millis = 42;

    bus.publish("agent-requests", Some(event)).await.unwrap();

    let expected = test_clock().now().timestamp_millis();
    let records = broker.records("agent-requests");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].timestamp_millis, expected);
    let stored = Event::decode(records[0].payload.as_deref().unwrap()).unwrap();
    assert_eq!(stored.timestamp_millis, expected);
    assert_eq!(stored.payload, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_publish_failure_surfaces_as_publish_failed() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    broker.fail_next_publishes(1);

    let result = bus
        .publish("agent-requests", Some(Event::new("Request", vec![])))
        .await;

    assert!(matches!(
        result,
        Err(EventBusError::PublishFailed { ref topic, .. }) if topic == "agent-requests"
    ));
    assert_eq!(broker.record_count("agent-requests"), 0);
}

// ============================================================================
// Subscribe / Unsubscribe
// ============================================================================

#[tokio::test]
async fn test_published_event_reaches_late_subscriber() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "fresh-group");
    let order = OrderPlaced {
        x: "value1".to_string(),
    };

    bus.publish("orders", Some(Event::with_data("OrderPlaced", &order).unwrap()))
        .await
        .unwrap();

    let recorder = RecordingHandler::new();
    bus.subscribe("orders", recorder.handler()).await.unwrap();

    assert!(recorder.wait_for(1, WAIT).await);
    let received: OrderPlaced = recorder.events()[0].data().unwrap();
    assert_eq!(received, order);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_subscribe_creates_one_loop() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();

    bus.subscribe("agent-requests", first.handler()).await.unwrap();
    bus.subscribe("agent-requests", second.handler()).await.unwrap();

    assert_eq!(broker.consumers_created(), 1);
    assert_eq!(bus.subscriptions().await, vec!["agent-requests".to_string()]);

    bus.publish("agent-requests", Some(Event::new("Request", vec![])))
        .await
        .unwrap();
    assert!(first.wait_for(1, WAIT).await);
    assert_eq!(second.count(), 0);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_unknown_topic_is_noop() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");

    bus.unsubscribe("never-subscribed").await;

    assert!(bus.subscriptions().await.is_empty());
    assert_eq!(broker.consumers_created(), 0);
}

#[tokio::test]
async fn test_unsubscribe_releases_consumer_and_stops_loop() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    let recorder = RecordingHandler::new();
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();
    wait_for_status(&bus, "agent-requests", |s| s.state == SubscriptionState::Active).await;

    bus.unsubscribe("agent-requests").await;

    assert!(bus.subscriptions().await.is_empty());
    assert!(bus.subscription_status("agent-requests").await.is_none());
    assert_eq!(broker.open_consumers(), 0);

    bus.publish("agent-requests", Some(Event::new("Late", vec![])))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn test_resubscribe_starts_new_active_loop() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");

    bus.subscribe("agent-requests", RecordingHandler::new().handler())
        .await
        .unwrap();
    bus.unsubscribe("agent-requests").await;

    let recorder = RecordingHandler::new();
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();
    let status = wait_for_status(&bus, "agent-requests", |s| s.state == SubscriptionState::Active).await;

    assert_eq!(status.state, SubscriptionState::Active);
    assert_eq!(broker.consumers_created(), 2);
    assert_eq!(broker.open_consumers(), 1);

    bus.publish("agent-requests", Some(Event::new("Request", vec![])))
        .await
        .unwrap();
    assert!(recorder.wait_for(1, WAIT).await);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_resubscribe_resumes_after_committed_offset() {
    let broker = InMemoryBroker::new().with_topic("agent-requests", 1);
    let bus = bus(&broker, "g");

    let first = RecordingHandler::new();
    bus.subscribe("agent-requests", first.handler()).await.unwrap();
    for name in ["m1", "m2"] {
        bus.publish("agent-requests", Some(Event::new(name, vec![])))
            .await
            .unwrap();
    }
    assert!(first.wait_for(2, WAIT).await);
    assert!(
        eventually(WAIT, || broker.committed_offset("g", "agent-requests", 0) == Some(2)).await
    );
    bus.unsubscribe("agent-requests").await;

    bus.publish("agent-requests", Some(Event::new("m3", vec![])))
        .await
        .unwrap();
    let second = RecordingHandler::new();
    bus.subscribe("agent-requests", second.handler()).await.unwrap();

    assert!(second.wait_for(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    let types: Vec<String> = second.events().into_iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec!["m3".to_string()]);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_separate_groups_each_receive_every_event() {
    let broker = InMemoryBroker::new();
    let scheduler = bus(&broker, "scheduler");
    let statistics = bus(&broker, "statistics");
    let a = RecordingHandler::new();
    let b = RecordingHandler::new();

    scheduler.subscribe("agent-responses", a.handler()).await.unwrap();
    statistics.subscribe("agent-responses", b.handler()).await.unwrap();
    scheduler
        .publish("agent-responses", Some(Event::new("Response", vec![])))
        .await
        .unwrap();

    assert!(a.wait_for(1, WAIT).await);
    assert!(b.wait_for(1, WAIT).await);

    scheduler.shutdown(WAIT).await.unwrap();
    statistics.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_consumer_creation_failure_fails_subscribe() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    broker.fail_next_consumer_creations(1);

    let result = bus
        .subscribe("agent-requests", RecordingHandler::new().handler())
        .await;

    assert!(matches!(result, Err(EventBusError::SubscriptionFailed { .. })));
    assert!(bus.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_subscribe_failure_releases_consumer() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    broker.fail_next_subscribes(1);

    let result = bus
        .subscribe("agent-requests", RecordingHandler::new().handler())
        .await;

    assert!(matches!(result, Err(EventBusError::SubscriptionFailed { .. })));
    assert!(bus.subscriptions().await.is_empty());
    assert_eq!(broker.open_consumers(), 0);
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_failing_handler_does_not_block_next_message() {
    let broker = InMemoryBroker::new().with_topic("agent-requests", 1);
    let bus = bus(&broker, "g");
    let recorder = RecordingHandler::new().failing_on("M1");
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();

    bus.publish("agent-requests", Some(Event::new("M1", vec![])))
        .await
        .unwrap();
    bus.publish("agent-requests", Some(Event::new("M2", vec![])))
        .await
        .unwrap();

    assert!(recorder.wait_for(2, WAIT).await);
    let status = wait_for_status(&bus, "agent-requests", |s| s.messages_handled == 1).await;
    assert_eq!(status.handler_failures, 1);
    assert_eq!(status.messages_handled, 1);
    assert_eq!(status.state, SubscriptionState::Active);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_does_not_end_loop() {
    let broker = InMemoryBroker::new().with_topic("agent-requests", 1);
    let bus = bus(&broker, "g");
    let recorder = RecordingHandler::new().panicking_on("M1");
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();

    bus.publish("agent-requests", Some(Event::new("M1", vec![])))
        .await
        .unwrap();
    bus.publish("agent-requests", Some(Event::new("M2", vec![])))
        .await
        .unwrap();

    assert!(recorder.wait_for(2, WAIT).await);
    let status = wait_for_status(&bus, "agent-requests", |s| s.messages_handled == 1).await;
    assert_eq!(status.handler_failures, 1);
    assert_eq!(status.state, SubscriptionState::Active);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_empty_and_undecodable_payloads_are_skipped() {
    let broker = InMemoryBroker::new().with_topic("agent-requests", 1);
    let bus = bus(&broker, "g");
    broker.inject_raw("agent-requests", None);
    broker.inject_raw("agent-requests", Some(vec![0xFF, 0x00, 0x01]));

    let recorder = RecordingHandler::new();
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();
    bus.publish("agent-requests", Some(Event::new("Valid", vec![])))
        .await
        .unwrap();

    assert!(recorder.wait_for(1, WAIT).await);
    let status = wait_for_status(&bus, "agent-requests", |s| s.messages_handled == 1).await;
    assert_eq!(status.empty_payloads, 1);
    assert_eq!(status.decode_failures, 1);
    assert_eq!(recorder.events()[0].event_type, "Valid");
    assert!(
        eventually(WAIT, || broker.committed_offset("g", "agent-requests", 0) == Some(3)).await
    );

    bus.shutdown(WAIT).await.unwrap();
}

// ============================================================================
// Broker faults
// ============================================================================

#[tokio::test]
async fn test_transient_faults_are_absorbed() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    broker.fail_next_receives(2);

    let recorder = RecordingHandler::new();
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();
    bus.publish("agent-requests", Some(Event::new("Request", vec![])))
        .await
        .unwrap();

    assert!(recorder.wait_for(1, WAIT).await);
    let status = bus.subscription_status("agent-requests").await.unwrap();
    assert_eq!(status.receive_faults, 2);
    assert_eq!(status.circuit, CircuitState::Closed);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_sustained_faults_open_circuit_and_stop_polling() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    broker.set_outage(true);

    bus.subscribe("agent-requests", RecordingHandler::new().handler())
        .await
        .unwrap();
    let status = wait_for_status(&bus, "agent-requests", |s| s.circuit == CircuitState::Open).await;

    assert_eq!(status.circuit, CircuitState::Open);
    assert_eq!(status.receive_faults, 3);

    let attempts = broker.receive_attempts();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.receive_attempts(), attempts);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_circuit_closes_after_broker_recovers() {
    let broker = InMemoryBroker::new();
    let options = fast_options().with_circuit_breaker(
        CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .cooldown(Duration::from_millis(30))
            .build(),
    );
    let bus = bus_with(&broker, &BusConfig::new(ClientConfig::default(), "g"), options);
    broker.set_outage(true);

    let recorder = RecordingHandler::new();
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();
    wait_for_status(&bus, "agent-requests", |s| s.circuit == CircuitState::Open).await;

    broker.restore();
    bus.publish("agent-requests", Some(Event::new("Request", vec![])))
        .await
        .unwrap();

    assert!(recorder.wait_for(1, WAIT).await);
    let status = wait_for_status(&bus, "agent-requests", |s| s.circuit == CircuitState::Closed).await;
    assert_eq!(status.circuit, CircuitState::Closed);

    bus.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_recovery_exhaustion_stops_loop_and_resubscribe_replaces_it() {
    let broker = InMemoryBroker::new();
    let options = fast_options()
        .with_circuit_breaker(
            CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .cooldown(Duration::from_millis(10))
                .max_cooldown(Duration::from_millis(20))
                .build(),
        )
        .with_max_failed_recoveries(Some(2));
    let bus = bus_with(&broker, &BusConfig::new(ClientConfig::default(), "g"), options);
    broker.set_outage(true);

    bus.subscribe("agent-requests", RecordingHandler::new().handler())
        .await
        .unwrap();
    let status = wait_for_status(&bus, "agent-requests", |s| s.state == SubscriptionState::Stopped).await;

    assert_eq!(status.state, SubscriptionState::Stopped);
    assert_eq!(status.exit, Some(LoopExit::RecoveryExhausted { failed_trials: 2 }));
    assert!(eventually(WAIT, || broker.open_consumers() == 0).await);

    broker.restore();
    let recorder = RecordingHandler::new();
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();
    let status = wait_for_status(&bus, "agent-requests", |s| s.state == SubscriptionState::Active).await;
    assert_eq!(status.state, SubscriptionState::Active);
    assert_eq!(status.exit, None);
    assert_eq!(broker.consumers_created(), 2);

    bus.publish("agent-requests", Some(Event::new("Request", vec![])))
        .await
        .unwrap();
    assert!(recorder.wait_for(1, WAIT).await);

    bus.shutdown(WAIT).await.unwrap();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_joins_every_loop() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    for topic in ["agent-requests", "agent-responses", "statistics"] {
        bus.subscribe(topic, RecordingHandler::new().handler())
            .await
            .unwrap();
    }
    assert_eq!(broker.open_consumers(), 3);

    bus.shutdown(WAIT).await.unwrap();

    assert!(bus.subscriptions().await.is_empty());
    assert_eq!(broker.open_consumers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_reports_loops_that_do_not_stop() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "g");
    let started = Arc::new(AtomicBool::new(false));
    let in_handler = Arc::clone(&started);

    bus.subscribe(
        "slow",
        handler(move |_| {
            in_handler.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(400));
            Ok(())
        }),
    )
    .await
    .unwrap();
    bus.publish("slow", Some(Event::new("Request", vec![])))
        .await
        .unwrap();
    assert!(eventually(WAIT, || started.load(Ordering::SeqCst)).await);

    let result = bus.shutdown(Duration::from_millis(50)).await;

    assert_eq!(
        result,
        Err(EventBusError::ShutdownTimeout {
            topics: vec!["slow".to_string()]
        })
    );
    assert!(bus.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_bus_is_usable_as_trait_object() {
    let broker = InMemoryBroker::new();
    let bus: Arc<dyn EventBus> = Arc::new(bus(&broker, "g"));

    let recorder = RecordingHandler::new();
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();
    bus.publish("agent-requests", Some(Event::new("Request", vec![])))
        .await
        .unwrap();
    assert!(recorder.wait_for(1, WAIT).await);

    bus.unsubscribe("agent-requests").await;
    assert_eq!(broker.open_consumers(), 0);
}

#[tokio::test]
async fn test_consumer_factory_group_is_bus_group() {
    let broker = InMemoryBroker::new().with_topic("agent-requests", 1);
    let bus = bus(&broker, "crawler-7");
    assert_eq!(bus.consumer_group(), "crawler-7");

    let recorder = RecordingHandler::new();
    bus.subscribe("agent-requests", recorder.handler()).await.unwrap();
    bus.publish("agent-requests", Some(Event::new("Request", vec![])))
        .await
        .unwrap();
    assert!(recorder.wait_for(1, WAIT).await);
    assert!(
        eventually(WAIT, || broker.committed_offset("crawler-7", "agent-requests", 0) == Some(1))
            .await
    );

    // A new member of the same group starts after the committed record.
    let consumer = broker.create_consumer("crawler-7").unwrap();
    consumer.subscribe("agent-requests").unwrap();
    assert_eq!(consumer.recv(Duration::from_millis(20)).await, Ok(None));
    consumer.close();

    bus.shutdown(WAIT).await.unwrap();
}
