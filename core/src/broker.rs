//! Broker substrate traits.
//!
//! The runtime drives a partitioned log broker through four small seams:
//!
//! - [`BrokerProducer`]: acknowledged writes
//! - [`ConsumerFactory`] / [`BrokerConsumer`]: group consumers with bounded pulls
//! - [`BrokerAdmin`]: partition metadata and topic provisioning
//!
//! `spider-bus-kafka` implements them with rdkafka; `spider-bus-testing`
//! implements them in memory with fault injection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by the substrate traits.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Faults reported by a broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Topic creation raced with another creator
    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    /// Partition increase rejected (count not larger than the current one)
    #[error("Invalid partition count: {0}")]
    InvalidPartitions(String),

    /// The broker did not answer in time
    #[error("Broker operation timed out")]
    Timeout,

    /// Network or broker-side failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Client construction or configuration failure
    #[error("Client error: {0}")]
    Client(String),

    /// The client was already closed
    #[error("Client closed")]
    Closed,
}

/// Outgoing record handed to a [`BrokerProducer`].
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    /// Target topic
    pub topic: String,
    /// Encoded envelope
    pub payload: Vec<u8>,
    /// Record timestamp in epoch milliseconds
    pub timestamp_millis: i64,
}

/// Where the broker stored an acknowledged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Partition selected by the partitioner
    pub partition: i32,
    /// Offset within that partition
    pub offset: i64,
}

/// A record pulled by a [`BrokerConsumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Raw payload; `None` for records written without a value
    pub payload: Option<Vec<u8>>,
}

/// Producer side of the broker.
///
/// Must be safe for concurrent use: every publisher in the process shares one.
pub trait BrokerProducer: Send + Sync {
    /// Write a record and wait for the broker acknowledgment.
    fn send(&self, record: OutgoingRecord, timeout: Duration) -> BrokerFuture<'_, Delivery>;
}

/// A consumer-group member bound to one topic.
pub trait BrokerConsumer: Send + Sync {
    /// Join the consumer group for `topic`.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the subscription cannot be registered.
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    /// Pull the next record, waiting at most `poll_interval`.
    ///
    /// `Ok(None)` means the interval elapsed without a record.
    fn recv(&self, poll_interval: Duration) -> BrokerFuture<'_, Option<ReceivedMessage>>;

    /// Mark `message` as processed so its offset is included in the next commit.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the offset cannot be stored.
    fn commit(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Leave the group and release the client.
    fn close(&self);
}

/// Creates consumers that share one consumer-group id.
pub trait ConsumerFactory: Send + Sync {
    /// Build a new consumer for `group_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Client`] if the client cannot be constructed.
    fn create_consumer(&self, group_id: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;
}

/// Administrative operations used for topic provisioning.
pub trait BrokerAdmin: Send + Sync {
    /// Current partition count of `topic`; `0` when the topic does not exist.
    fn partition_count(&self, topic: &str, timeout: Duration) -> BrokerFuture<'_, usize>;

    /// Create `topic` with `partitions` partitions.
    fn create_topic(
        &self,
        topic: &str,
        partitions: usize,
        replication_factor: i32,
        timeout: Duration,
    ) -> BrokerFuture<'_, ()>;

    /// Grow `topic` to `total_partitions` partitions.
    fn create_partitions(
        &self,
        topic: &str,
        total_partitions: usize,
        timeout: Duration,
    ) -> BrokerFuture<'_, ()>;
}
