//! In-memory broker implementing the substrate traits.
//!
//! Topics are vectors of partitions, partitions are vectors of records.
//! Consumer groups keep a committed offset and a read cursor per partition;
//! a consumer joining a group rewinds the group's cursors to the committed
//! offsets, so uncommitted records are redelivered like after a rebalance.
//! Consumers of different groups see every record.
//!
//! Faults can be injected on each seam:
//!
//! - receive faults (a number of failing pulls, or a full outage)
//! - publish failures
//! - consumer creation and subscribe failures
//! - admin failures
//! - lost provisioning races: a stale metadata read that hides a topic
//!   once, or a competing partition increase
//!
//! # Example
//!
//! ```
//! use spider_bus_testing::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new().with_topic("agent-requests", 4);
//! assert_eq!(broker.partitions("agent-requests"), 4);
//! broker.fail_next_receives(3);
//! ```

use rand::Rng;
use spider_bus_core::broker::{
    BrokerAdmin, BrokerConsumer, BrokerError, BrokerFuture, BrokerProducer, ConsumerFactory,
    Delivery, OutgoingRecord, ReceivedMessage,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How often an idle pull re-checks for records.
const IDLE_TICK: Duration = Duration::from_millis(2);

/// A stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Raw payload (`None` for a tombstone-like record)
    pub payload: Option<Vec<u8>>,
    /// Record timestamp in milliseconds
    pub timestamp_millis: i64,
}

/// Administrative call observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCall {
    /// Metadata query
    PartitionCount(String),
    /// Topic creation
    CreateTopic {
        /// Topic name
        topic: String,
        /// Requested partitions
        partitions: usize,
        /// Requested replication factor
        replication_factor: i32,
    },
    /// Partition increase
    CreatePartitions {
        /// Topic name
        topic: String,
        /// Requested total
        total: usize,
    },
}

#[derive(Debug, Default)]
struct Faults {
    receive_failures: u32,
    outage: bool,
    publish_failures: u32,
    consumer_creation_failures: u32,
    subscribe_failures: u32,
    admin_failures: Vec<BrokerError>,
    stale_topics: HashSet<String>,
    partition_race: Option<(String, usize)>,
}

#[derive(Debug, Default)]
struct GroupOffsets {
    committed: HashMap<(String, i32), i64>,
    cursor: HashMap<(String, i32), i64>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, GroupOffsets>,
    faults: Faults,
    admin_calls: Vec<AdminCall>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    consumers_created: AtomicUsize,
    open_consumers: AtomicUsize,
    receive_attempts: AtomicU64,
}

/// In-memory partitioned log broker.
///
/// Cloning yields another handle to the same broker, so one instance can be
/// handed to a bus as producer, consumer factory and admin at once while
/// the test keeps a handle for assertions and fault injection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create `topic` with `partitions` partitions.
    #[must_use]
    pub fn with_topic(self, topic: &str, partitions: usize) -> Self {
        self.state()
            .topics
            .insert(topic.to_string(), vec![Vec::new(); partitions]);
        self
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` pulls fail with a transport error.
    pub fn fail_next_receives(&self, count: u32) {
        self.state().faults.receive_failures = count;
    }

    /// Fail every pull and every publish until [`Self::restore`] is called.
    pub fn set_outage(&self, outage: bool) {
        self.state().faults.outage = outage;
    }

    /// End an outage.
    pub fn restore(&self) {
        self.set_outage(false);
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().faults.publish_failures = count;
    }

    /// Make the next `count` consumer creations fail.
    pub fn fail_next_consumer_creations(&self, count: u32) {
        self.state().faults.consumer_creation_failures = count;
    }

    /// Make the next `count` consumer subscriptions fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.state().faults.subscribe_failures = count;
    }

    /// Queue an error for the next administrative call.
    pub fn fail_next_admin_call(&self, error: BrokerError) {
        self.state().faults.admin_failures.push(error);
    }

    /// Report `topic` as missing on the next metadata query even if it
    /// exists, as when another process creates it concurrently.
    pub fn hide_topic_once(&self, topic: &str) {
        self.state().faults.stale_topics.insert(topic.to_string());
    }

    /// Grow `topic` to `partitions` right before the next partition increase
    /// is applied, as when another process wins the race to grow it.
    pub fn race_next_partition_increase(&self, topic: &str, partitions: usize) {
        self.state().faults.partition_race = Some((topic.to_string(), partitions));
    }

    /// Append a raw record to partition 0 of `topic`, bypassing the envelope.
    pub fn inject_raw(&self, topic: &str, payload: Option<Vec<u8>>) {
        let mut state = self.state();
        let log = state.topics.entry(topic.to_string()).or_default();
        if log.is_empty() {
            log.push(Vec::new());
        }
        log[0].push(StoredRecord {
            payload,
            timestamp_millis: 0,
        });
    }

    /// Current partition count of `topic` (`0` if missing).
    #[must_use]
    pub fn partitions(&self, topic: &str) -> usize {
        self.state().topics.get(topic).map_or(0, Vec::len)
    }

    /// All records of `topic`, partition by partition.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        self.state()
            .topics
            .get(topic)
            .map(|log| log.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of records written to `topic`.
    #[must_use]
    pub fn record_count(&self, topic: &str) -> usize {
        self.state()
            .topics
            .get(topic)
            .map_or(0, |log| log.iter().map(Vec::len).sum())
    }

    /// Next offset `group` will resume from on `topic`/`partition`.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .groups
            .get(group)
            .and_then(|offsets| offsets.committed.get(&(topic.to_string(), partition)))
            .copied()
    }

    /// Administrative calls observed so far.
    #[must_use]
    pub fn admin_calls(&self) -> Vec<AdminCall> {
        self.state().admin_calls.clone()
    }

    /// Consumers created over the broker's lifetime.
    #[must_use]
    pub fn consumers_created(&self) -> usize {
        self.shared.consumers_created.load(Ordering::SeqCst)
    }

    /// Consumers created and not yet closed.
    #[must_use]
    pub fn open_consumers(&self) -> usize {
        self.shared.open_consumers.load(Ordering::SeqCst)
    }

    /// Pulls attempted by all consumers.
    #[must_use]
    pub fn receive_attempts(&self) -> u64 {
        self.shared.receive_attempts.load(Ordering::SeqCst)
    }

    fn take_admin_failure(state: &mut BrokerState) -> Result<(), BrokerError> {
        if state.faults.admin_failures.is_empty() {
            Ok(())
        } else {
            Err(state.faults.admin_failures.remove(0))
        }
    }

    fn append(&self, record: OutgoingRecord) -> Result<Delivery, BrokerError> {
        let mut state = self.state();
        if state.faults.outage {
            return Err(BrokerError::Transport("broker unavailable".to_string()));
        }
        if state.faults.publish_failures > 0 {
            state.faults.publish_failures -= 1;
            return Err(BrokerError::Timeout);
        }

        let log = state.topics.entry(record.topic).or_default();
        if log.is_empty() {
            log.push(Vec::new());
        }
        let partition = rand::thread_rng().gen_range(0..log.len());
        let records = &mut log[partition];
        records.push(StoredRecord {
            payload: Some(record.payload),
            timestamp_millis: record.timestamp_millis,
        });

        Ok(Delivery {
            partition: i32::try_from(partition).unwrap_or(i32::MAX),
            offset: i64::try_from(records.len() - 1).unwrap_or(i64::MAX),
        })
    }
}

impl BrokerProducer for InMemoryBroker {
    fn send(&self, record: OutgoingRecord, _timeout: Duration) -> BrokerFuture<'_, Delivery> {
        Box::pin(async move { self.append(record) })
    }
}

impl ConsumerFactory for InMemoryBroker {
    fn create_consumer(&self, group_id: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        {
            let mut state = self.state();
            if state.faults.consumer_creation_failures > 0 {
                state.faults.consumer_creation_failures -= 1;
                return Err(BrokerError::Client("consumer creation refused".to_string()));
            }
        }
        self.shared.consumers_created.fetch_add(1, Ordering::SeqCst);
        self.shared.open_consumers.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            topic: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

impl BrokerAdmin for InMemoryBroker {
    fn partition_count(&self, topic: &str, _timeout: Duration) -> BrokerFuture<'_, usize> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut state = self.state();
            state.admin_calls.push(AdminCall::PartitionCount(topic.clone()));
            Self::take_admin_failure(&mut state)?;
            if state.faults.stale_topics.remove(&topic) {
                return Ok(0);
            }
            Ok(state.topics.get(&topic).map_or(0, Vec::len))
        })
    }

    fn create_topic(
        &self,
        topic: &str,
        partitions: usize,
        replication_factor: i32,
        _timeout: Duration,
    ) -> BrokerFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut state = self.state();
            state.admin_calls.push(AdminCall::CreateTopic {
                topic: topic.clone(),
                partitions,
                replication_factor,
            });
            Self::take_admin_failure(&mut state)?;
            if state.topics.contains_key(&topic) {
                return Err(BrokerError::TopicAlreadyExists(topic));
            }
            state.topics.insert(topic, vec![Vec::new(); partitions]);
            Ok(())
        })
    }

    fn create_partitions(
        &self,
        topic: &str,
        total_partitions: usize,
        _timeout: Duration,
    ) -> BrokerFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut state = self.state();
            state.admin_calls.push(AdminCall::CreatePartitions {
                topic: topic.clone(),
                total: total_partitions,
            });
            Self::take_admin_failure(&mut state)?;
            if let Some((raced, partitions)) = state.faults.partition_race.take() {
                if let Some(log) = state.topics.get_mut(&raced) {
                    if log.len() < partitions {
                        log.resize(partitions, Vec::new());
                    }
                }
            }
            let Some(log) = state.topics.get_mut(&topic) else {
                return Err(BrokerError::Client(format!("unknown topic {topic}")));
            };
            if total_partitions <= log.len() {
                return Err(BrokerError::InvalidPartitions(format!(
                    "topic {topic} already has {} partitions",
                    log.len()
                )));
            }
            log.resize(total_partitions, Vec::new());
            Ok(())
        })
    }
}

/// Group member created by [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group_id: String,
    topic: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl InMemoryConsumer {
    fn subscribed_topic(&self) -> Option<String> {
        self.topic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One non-blocking fetch attempt.
    fn try_fetch(&self, topic: &str) -> Result<Option<ReceivedMessage>, BrokerError> {
        let mut state = self.broker.state();
        let faults = &mut state.faults;
        if faults.outage {
            return Err(BrokerError::Transport("broker unavailable".to_string()));
        }
        if faults.receive_failures > 0 {
            faults.receive_failures -= 1;
            return Err(BrokerError::Transport("connection reset".to_string()));
        }

        let BrokerState { topics, groups, .. } = &mut *state;
        let Some(log) = topics.get(topic) else {
            return Ok(None);
        };
        let offsets = groups.entry(self.group_id.clone()).or_default();

        for (index, records) in log.iter().enumerate() {
            let partition = i32::try_from(index).unwrap_or(i32::MAX);
            let cursor = offsets
                .cursor
                .entry((topic.to_string(), partition))
                .or_insert(0);
            let Ok(position) = usize::try_from(*cursor) else {
                continue;
            };
            if let Some(record) = records.get(position) {
                let message = ReceivedMessage {
                    topic: topic.to_string(),
                    partition,
                    offset: *cursor,
                    payload: record.payload.clone(),
                };
                *cursor += 1;
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

impl BrokerConsumer for InMemoryConsumer {
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        if state.faults.subscribe_failures > 0 {
            state.faults.subscribe_failures -= 1;
            return Err(BrokerError::Client("subscription refused".to_string()));
        }

        // Joining the group rewinds its cursors to the committed offsets.
        let offsets = state.groups.entry(self.group_id.clone()).or_default();
        let committed: Vec<((String, i32), i64)> = offsets
            .committed
            .iter()
            .filter(|((committed_topic, _), _)| committed_topic == topic)
            .map(|(key, offset)| (key.clone(), *offset))
            .collect();
        offsets.cursor.retain(|(cursor_topic, _), _| cursor_topic != topic);
        offsets.cursor.extend(committed);
        drop(state);

        *self.topic.lock().unwrap_or_else(PoisonError::into_inner) = Some(topic.to_string());
        Ok(())
    }

    fn recv(&self, poll_interval: Duration) -> BrokerFuture<'_, Option<ReceivedMessage>> {
        Box::pin(async move {
            self.broker
                .shared
                .receive_attempts
                .fetch_add(1, Ordering::SeqCst);
            let deadline = tokio::time::Instant::now() + poll_interval;

            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(BrokerError::Closed);
                }
                let Some(topic) = self.subscribed_topic() else {
                    return Err(BrokerError::Client("consumer not subscribed".to_string()));
                };
                if let Some(message) = self.try_fetch(&topic)? {
                    return Ok(Some(message));
                }

                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(IDLE_TICK.min(deadline - now)).await;
            }
        })
    }

    fn commit(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let mut state = self.broker.state();
        let offsets = state.groups.entry(self.group_id.clone()).or_default();
        let next = message.offset + 1;
        let committed = offsets
            .committed
            .entry((message.topic.clone(), message.partition))
            .or_insert(next);
        *committed = (*committed).max(next);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker
                .shared
                .open_consumers
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}
