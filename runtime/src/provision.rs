//! Topic provisioning for partitioned topics.
//!
//! Before a partitioned topic is consumed, the provisioner makes sure the
//! broker holds at least the configured number of partitions:
//!
//! ```text
//! partitions == 0          → create topic (min partitions, replication 1)
//! 0 < partitions < min     → grow to min
//! partitions >= min        → nothing
//! ```
//!
//! Several processes may race to provision the same topic. Losing a race
//! (`TopicAlreadyExists`, or `InvalidPartitions` because someone else grew
//! the topic first) is resolved by re-reading the partition count.
//!
//! Every admin call is bounded by the provisioner's timeout, independent of
//! whether the admin client honours the timeout it is handed. An elapsed
//! call fails provisioning with [`BrokerError::Timeout`].

use crate::metrics::ProvisioningMetrics;
use spider_bus_core::broker::{BrokerAdmin, BrokerError, BrokerFuture};
use spider_bus_core::event_bus::EventBusError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Replication factor used for topics created by the provisioner.
pub const REPLICATION_FACTOR: i32 = 1;

/// What provisioning did for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The topic is not flagged as partitioned
    NotPartitioned,
    /// The topic did not exist and was created
    Created {
        /// Partition count after creation
        partitions: usize,
    },
    /// The topic existed with too few partitions and was grown
    Expanded {
        /// Partition count before
        from: usize,
        /// Partition count after
        to: usize,
    },
    /// The topic already had enough partitions
    Sufficient {
        /// Current partition count
        partitions: usize,
    },
}

impl ProvisionOutcome {
    const fn label(self) -> &'static str {
        match self {
            Self::NotPartitioned => "not_partitioned",
            Self::Created { .. } => "created",
            Self::Expanded { .. } => "expanded",
            Self::Sufficient { .. } => "sufficient",
        }
    }
}

/// Ensures partitioned topics have their minimum partition count.
#[derive(Clone)]
pub struct TopicProvisioner {
    admin: Arc<dyn BrokerAdmin>,
    partition_topics: HashMap<String, usize>,
    timeout: Duration,
}

impl TopicProvisioner {
    /// Create a provisioner for the given partition table.
    #[must_use]
    pub fn new(
        admin: Arc<dyn BrokerAdmin>,
        partition_topics: HashMap<String, usize>,
        timeout: Duration,
    ) -> Self {
        Self {
            admin,
            partition_topics,
            timeout,
        }
    }

    /// Minimum partition count for `topic`, if it is partitioned.
    #[must_use]
    pub fn min_partitions(&self, topic: &str) -> Option<usize> {
        self.partition_topics.get(topic).copied()
    }

    /// Bring `topic` to its minimum partition count.
    ///
    /// Returns immediately with [`ProvisionOutcome::NotPartitioned`] for
    /// topics without a configured minimum. Partition counts are never
    /// reduced.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ProvisioningFailed`] if metadata cannot be
    /// read, or creation/growth fails for a reason other than a lost race.
    pub async fn ensure(&self, topic: &str) -> Result<ProvisionOutcome, EventBusError> {
        let Some(min_partitions) = self.min_partitions(topic) else {
            return Ok(ProvisionOutcome::NotPartitioned);
        };

        match self.provision(topic, min_partitions).await {
            Ok(outcome) => {
                ProvisioningMetrics::record_outcome(topic, outcome.label());
                tracing::info!(
                    topic = %topic,
                    min_partitions,
                    outcome = ?outcome,
                    "Topic provisioned"
                );
                Ok(outcome)
            }
            Err(error) => {
                ProvisioningMetrics::record_outcome(topic, "failed");
                tracing::error!(
                    topic = %topic,
                    min_partitions,
                    error = %error,
                    "Failed to provision topic"
                );
                Err(EventBusError::ProvisioningFailed {
                    topic: topic.to_string(),
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Await one admin call, giving up after the admin timeout.
    async fn bounded<T>(&self, call: BrokerFuture<'_, T>) -> Result<T, BrokerError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| BrokerError::Timeout)?
    }

    async fn provision(
        &self,
        topic: &str,
        min_partitions: usize,
    ) -> Result<ProvisionOutcome, BrokerError> {
        let current = self.bounded(self.admin.partition_count(topic, self.timeout)).await?;

        if current == 0 {
            tracing::debug!(topic = %topic, min_partitions, "Creating topic");
            return match self
                .bounded(
                    self.admin
                        .create_topic(topic, min_partitions, REPLICATION_FACTOR, self.timeout),
                )
                .await
            {
                Ok(()) => Ok(ProvisionOutcome::Created {
                    partitions: min_partitions,
                }),
                Err(BrokerError::TopicAlreadyExists(_)) => {
                    tracing::debug!(topic = %topic, "Topic created concurrently by another process");
                    self.grow_after_race(topic, min_partitions).await
                }
                Err(error) => Err(error),
            };
        }

        if current < min_partitions {
            return self.grow(topic, current, min_partitions).await;
        }

        Ok(ProvisionOutcome::Sufficient {
            partitions: current,
        })
    }

    async fn grow(
        &self,
        topic: &str,
        current: usize,
        min_partitions: usize,
    ) -> Result<ProvisionOutcome, BrokerError> {
        tracing::debug!(topic = %topic, from = current, to = min_partitions, "Increasing partitions");
        match self
            .bounded(self.admin.create_partitions(topic, min_partitions, self.timeout))
            .await
        {
            Ok(()) => Ok(ProvisionOutcome::Expanded {
                from: current,
                to: min_partitions,
            }),
            Err(BrokerError::InvalidPartitions(reason)) => {
                let now = self.bounded(self.admin.partition_count(topic, self.timeout)).await?;
                if now >= min_partitions {
                    Ok(ProvisionOutcome::Sufficient { partitions: now })
                } else {
                    Err(BrokerError::InvalidPartitions(reason))
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn grow_after_race(
        &self,
        topic: &str,
        min_partitions: usize,
    ) -> Result<ProvisionOutcome, BrokerError> {
        let current = self.bounded(self.admin.partition_count(topic, self.timeout)).await?;
        if current >= min_partitions {
            Ok(ProvisionOutcome::Sufficient {
                partitions: current,
            })
        } else {
            self.grow(topic, current, min_partitions).await
        }
    }
}
