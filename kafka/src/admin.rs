//! `AdminClient` behind [`BrokerAdmin`].

use crate::client::{base_config, broker_error};
use rdkafka::admin::{
    AdminClient, AdminOptions, NewPartitions, NewTopic, TopicReplication, TopicResult,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::RDKafkaErrorCode;
use spider_bus_core::broker::{BrokerAdmin, BrokerError, BrokerFuture};
use spider_bus_core::config::ClientConfig;
use std::sync::Arc;
use std::time::Duration;

/// Topic metadata and provisioning through the Kafka admin API.
pub struct KafkaAdmin {
    admin: Arc<AdminClient<DefaultClientContext>>,
}

impl KafkaAdmin {
    /// Create the admin client.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Client`] if librdkafka rejects the configuration.
    pub fn new(client: &ClientConfig) -> Result<Self, BrokerError> {
        let admin: AdminClient<DefaultClientContext> = base_config(client)
            .create()
            .map_err(|e| BrokerError::Client(format!("Failed to create admin client: {e}")))?;
        Ok(Self {
            admin: Arc::new(admin),
        })
    }

    fn options(timeout: Duration) -> AdminOptions {
        AdminOptions::new()
            .request_timeout(Some(timeout))
            .operation_timeout(Some(timeout))
    }
}

/// Single-topic admin result to substrate result.
fn topic_result(results: Vec<TopicResult>) -> Result<(), BrokerError> {
    for result in results {
        if let Err((topic, code)) = result {
            return Err(match code {
                RDKafkaErrorCode::TopicAlreadyExists => BrokerError::TopicAlreadyExists(topic),
                RDKafkaErrorCode::InvalidPartitions => {
                    BrokerError::InvalidPartitions(format!("{topic}: {code}"))
                }
                RDKafkaErrorCode::RequestTimedOut | RDKafkaErrorCode::OperationTimedOut => {
                    BrokerError::Timeout
                }
                other => BrokerError::Transport(format!("{topic}: {other}")),
            });
        }
    }
    Ok(())
}

impl BrokerAdmin for KafkaAdmin {
    fn partition_count(&self, topic: &str, timeout: Duration) -> BrokerFuture<'_, usize> {
        let topic = topic.to_string();
        let admin = Arc::clone(&self.admin);
        Box::pin(async move {
            // Metadata fetches block the calling thread.
            tokio::task::spawn_blocking(move || -> Result<usize, BrokerError> {
                let metadata = admin
                    .inner()
                    .fetch_metadata(Some(topic.as_str()), timeout)
                    .map_err(|e| broker_error(&e))?;
                Ok(metadata
                    .topics()
                    .iter()
                    .find(|candidate| candidate.name() == topic)
                    .map_or(0, |found| found.partitions().len()))
            })
            .await
            .map_err(|e| BrokerError::Client(format!("Metadata task failed: {e}")))?
        })
    }

    fn create_topic(
        &self,
        topic: &str,
        partitions: usize,
        replication_factor: i32,
        timeout: Duration,
    ) -> BrokerFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let partitions = i32::try_from(partitions).map_err(|_| {
                BrokerError::InvalidPartitions(format!("{partitions} partitions out of range"))
            })?;
            let new_topic = NewTopic::new(
                &topic,
                partitions,
                TopicReplication::Fixed(replication_factor),
            );
            let results = self
                .admin
                .create_topics(&[new_topic], &Self::options(timeout))
                .await
                .map_err(|e| broker_error(&e))?;
            topic_result(results)
        })
    }

    fn create_partitions(
        &self,
        topic: &str,
        total_partitions: usize,
        timeout: Duration,
    ) -> BrokerFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let increase = NewPartitions::new(&topic, total_partitions);
            let results = self
                .admin
                .create_partitions(&[increase], &Self::options(timeout))
                .await
                .map_err(|e| broker_error(&e))?;
            topic_result(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_is_reported_as_race() {
        let result = topic_result(vec![Err((
            "agent-requests".to_string(),
            RDKafkaErrorCode::TopicAlreadyExists,
        ))]);
        assert_eq!(
            result,
            Err(BrokerError::TopicAlreadyExists("agent-requests".to_string()))
        );
    }

    #[test]
    fn invalid_partitions_is_reported_as_race() {
        let result = topic_result(vec![Err((
            "agent-requests".to_string(),
            RDKafkaErrorCode::InvalidPartitions,
        ))]);
        assert!(matches!(result, Err(BrokerError::InvalidPartitions(_))));
    }

    #[test]
    fn successful_results_pass() {
        assert_eq!(topic_result(vec![Ok("agent-requests".to_string())]), Ok(()));
    }
}
