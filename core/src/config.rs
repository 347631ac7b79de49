//! Connection and bus configuration.
//!
//! [`ClientConfig`] carries the connection parameters shared unmodified by the
//! producer, consumer and admin clients. [`BusConfig`] adds the process-wide
//! consumer identity and the table of partitioned topics.
//!
//! Both can be built fluently or loaded from environment variables:
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `KAFKA_BROKERS` | `client.brokers` | `localhost:9092` |
//! | `KAFKA_SECURITY_PROTOCOL` | `client.security_protocol` | `plaintext` |
//! | `KAFKA_SASL_MECHANISM` | `client.sasl_mechanism` | unset |
//! | `KAFKA_SASL_USERNAME` | `client.sasl_username` | unset |
//! | `KAFKA_SASL_PASSWORD` | `client.sasl_password` | unset |
//! | `KAFKA_CONSUMER_GROUP` | `consumer_group` | `spider-bus` |
//! | `KAFKA_PARTITION_TOPICS` | `partition_topics` (`topic:count,...`) | empty |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A security protocol name was not recognised
    #[error("Unknown security protocol: {0}")]
    UnknownSecurityProtocol(String),

    /// A `topic:count` entry could not be parsed
    #[error("Invalid partition topic entry: {0}")]
    InvalidPartitionTopic(String),
}

/// Transport security used by every client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    /// Unencrypted, unauthenticated
    #[default]
    Plaintext,
    /// TLS
    Ssl,
    /// SASL without TLS
    SaslPlaintext,
    /// SASL over TLS
    SaslSsl,
}

impl SecurityProtocol {
    /// Name as understood by librdkafka's `security.protocol`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Ssl => "ssl",
            Self::SaslPlaintext => "sasl_plaintext",
            Self::SaslSsl => "sasl_ssl",
        }
    }
}

impl fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plaintext" => Ok(Self::Plaintext),
            "ssl" | "tls" => Ok(Self::Ssl),
            "sasl_plaintext" => Ok(Self::SaslPlaintext),
            "sasl_ssl" => Ok(Self::SaslSsl),
            other => Err(ConfigError::UnknownSecurityProtocol(other.to_string())),
        }
    }
}

/// Connection parameters shared by producer, consumer and admin clients.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Security protocol: plaintext, ssl, `sasl_plaintext`, `sasl_ssl`
    pub security_protocol: SecurityProtocol,
    /// SASL mechanism: PLAIN, SCRAM-SHA-256, SCRAM-SHA-512
    pub sasl_mechanism: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
}

impl ClientConfig {
    /// Plaintext configuration for the given brokers.
    #[must_use]
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            security_protocol: SecurityProtocol::Plaintext,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }

    /// Set the security protocol.
    #[must_use]
    pub const fn with_security_protocol(mut self, protocol: SecurityProtocol) -> Self {
        self.security_protocol = protocol;
        self
    }

    /// Set SASL mechanism and credentials.
    #[must_use]
    pub fn with_sasl(
        mut self,
        mechanism: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.sasl_mechanism = Some(mechanism.into());
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self
    }

    /// Key/value pairs for a librdkafka client configuration.
    ///
    /// Unset optional fields are omitted.
    #[must_use]
    pub fn client_properties(&self) -> Vec<(&'static str, String)> {
        let mut properties = vec![
            ("bootstrap.servers", self.brokers.clone()),
            ("security.protocol", self.security_protocol.as_str().to_string()),
        ];
        if let Some(mechanism) = &self.sasl_mechanism {
            properties.push(("sasl.mechanisms", mechanism.clone()));
        }
        if let Some(username) = &self.sasl_username {
            properties.push(("sasl.username", username.clone()));
        }
        if let Some(password) = &self.sasl_password {
            properties.push(("sasl.password", password.clone()));
        }
        properties
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("localhost:9092")
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("brokers", &self.brokers)
            .field("security_protocol", &self.security_protocol)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("sasl_username", &self.sasl_username)
            .field("sasl_password", &self.sasl_password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Process-wide bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Connection parameters
    pub client: ClientConfig,
    /// Consumer group shared by every subscription of this process
    pub consumer_group: String,
    /// Partitioned topics and their minimum partition counts
    pub partition_topics: HashMap<String, usize>,
}

impl BusConfig {
    /// Configuration with no partitioned topics.
    #[must_use]
    pub fn new(client: ClientConfig, consumer_group: impl Into<String>) -> Self {
        Self {
            client,
            consumer_group: consumer_group.into(),
            partition_topics: HashMap::new(),
        }
    }

    /// Flag `topic` as partitioned with at least `min_partitions` partitions.
    #[must_use]
    pub fn with_partition_topic(mut self, topic: impl Into<String>, min_partitions: usize) -> Self {
        self.partition_topics.insert(topic.into(), min_partitions);
        self
    }

    /// Minimum partition count for `topic`, if it is partitioned.
    #[must_use]
    pub fn min_partitions(&self, topic: &str) -> Option<usize> {
        self.partition_topics.get(topic).copied()
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `KAFKA_SECURITY_PROTOCOL` or
    /// `KAFKA_PARTITION_TOPICS` hold invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let security_protocol = match env::var("KAFKA_SECURITY_PROTOCOL") {
            Ok(value) => value.parse()?,
            Err(_) => SecurityProtocol::Plaintext,
        };

        let partition_topics = match env::var("KAFKA_PARTITION_TOPICS") {
            Ok(value) => parse_partition_topics(&value)?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            client: ClientConfig {
                brokers: env::var("KAFKA_BROKERS")
                    .unwrap_or_else(|_| "localhost:9092".to_string()),
                security_protocol,
                sasl_mechanism: env::var("KAFKA_SASL_MECHANISM").ok(),
                sasl_username: env::var("KAFKA_SASL_USERNAME").ok(),
                sasl_password: env::var("KAFKA_SASL_PASSWORD").ok(),
            },
            consumer_group: env::var("KAFKA_CONSUMER_GROUP")
                .unwrap_or_else(|_| "spider-bus".to_string()),
            partition_topics,
        })
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new(ClientConfig::default(), "spider-bus")
    }
}

/// Parse `topic:count,topic:count` into a partition table.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidPartitionTopic`] for entries without a
/// topic name or with a count that is not a positive integer.
pub fn parse_partition_topics(value: &str) -> Result<HashMap<String, usize>, ConfigError> {
    let mut topics = HashMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (topic, count) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidPartitionTopic(entry.to_string()))?;
        let topic = topic.trim();
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPartitionTopic(entry.to_string()))?;
        if topic.is_empty() || count == 0 {
            return Err(ConfigError::InvalidPartitionTopic(entry.to_string()));
        }
        topics.insert(topic.to_string(), count);
    }
    Ok(topics)
}
