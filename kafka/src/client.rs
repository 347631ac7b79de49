//! librdkafka client configuration and error mapping shared by the adapters.

use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use spider_bus_core::broker::BrokerError;
use spider_bus_core::config::ClientConfig;

/// Base librdkafka configuration: brokers, security protocol and SASL.
///
/// Producer, consumer and admin clients all start from this.
#[must_use]
pub fn base_config(client: &ClientConfig) -> RdKafkaConfig {
    let mut config = RdKafkaConfig::new();
    for (key, value) in client.client_properties() {
        config.set(key, value);
    }
    config
}

/// Map an rdkafka error onto the substrate error type.
#[must_use]
pub fn broker_error(error: &KafkaError) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut,
        ) => BrokerError::Timeout,
        Some(RDKafkaErrorCode::TopicAlreadyExists) => {
            BrokerError::TopicAlreadyExists(error.to_string())
        }
        Some(RDKafkaErrorCode::InvalidPartitions) => {
            BrokerError::InvalidPartitions(error.to_string())
        }
        _ => match error {
            KafkaError::ClientConfig(..) | KafkaError::ClientCreation(_) => {
                BrokerError::Client(error.to_string())
            }
            _ => BrokerError::Transport(error.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spider_bus_core::config::SecurityProtocol;

    #[test]
    fn base_config_carries_sasl_settings() {
        let client = ClientConfig::new("broker-1:9092,broker-2:9092")
            .with_security_protocol(SecurityProtocol::SaslSsl)
            .with_sasl("SCRAM-SHA-512", "spider", "secret");

        let config = base_config(&client);

        assert_eq!(config.get("bootstrap.servers"), Some("broker-1:9092,broker-2:9092"));
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("sasl.mechanisms"), Some("SCRAM-SHA-512"));
        assert_eq!(config.get("sasl.username"), Some("spider"));
        assert_eq!(config.get("sasl.password"), Some("secret"));
    }

    #[test]
    fn base_config_omits_unset_credentials() {
        let config = base_config(&ClientConfig::new("localhost:9092"));

        assert_eq!(config.get("security.protocol"), Some("plaintext"));
        assert_eq!(config.get("sasl.username"), None);
    }

    #[test]
    fn timeouts_map_to_timeout() {
        let error = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert_eq!(broker_error(&error), BrokerError::Timeout);
    }

    #[test]
    fn transport_failures_map_to_transport() {
        let error = KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure);
        assert!(matches!(broker_error(&error), BrokerError::Transport(_)));
    }
}
