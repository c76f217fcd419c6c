use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{Result, ReservationError, TopicKind};

/// Consumer group shared by every reservation topic.
pub const DEFAULT_CONSUMER_GROUP: &str = "reservation_group";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub additional_properties: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            additional_properties: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    RocksDb,
}

impl std::str::FromStr for StorageBackend {
    type Err = ReservationError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "rocksdb" => Ok(Self::RocksDb),
            other => Err(ReservationError::InvalidArgument(format!(
                "Unknown storage backend: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub application_id: String,
    pub state_dir: String,
    pub kafka: KafkaConfig,
    pub consumer_group: String,
    pub poll_timeout_ms: u64,
    pub poll_error_backoff_ms: u64,
    pub channel_capacity: usize,
    pub publish_workers: usize,
    pub publish_timeout_ms: u64,
    pub handler_timeout_ms: Option<u64>,
    pub allocation_attempts: u32,
    pub shutdown_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub storage: StorageBackend,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            application_id: "reservation-service".to_string(),
            state_dir: "/tmp/reservation-service".to_string(),
            kafka: KafkaConfig::default(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            poll_timeout_ms: 1000,
            poll_error_backoff_ms: 100,
            channel_capacity: 256,
            publish_workers: 4,
            publish_timeout_ms: 10_000,
            handler_timeout_ms: Some(30_000),
            allocation_attempts: 3,
            shutdown_timeout_ms: 60_000,
            shutdown_grace_ms: 5_000,
            storage: StorageBackend::RocksDb,
        }
    }
}

impl ServiceConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Worst case for stopping the consumers with every topic subscribed: the
    /// dispatch loop bound, the wait for cancelled handlers and the producer
    /// flush. The shutdown timeout must leave room after this for the
    /// components registered behind the consumers.
    pub fn consumer_stop_budget(&self) -> Duration {
        let consumers = TopicKind::ALL.len() as u32;
        self.poll_timeout() * consumers
            + self.handler_timeout().unwrap_or_default()
            + self.shutdown_grace() * 2
            + self.publish_timeout()
    }

    /// Client settings shared by producers and consumers.
    pub fn base_kafka_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config.set("bootstrap.servers", &self.kafka.bootstrap_servers);
        config.set("client.id", &self.application_id);

        if let Some(security_protocol) = &self.kafka.security_protocol {
            config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanism) = &self.kafka.sasl_mechanism {
            config.set("sasl.mechanism", sasl_mechanism);
        }

        if let Some(sasl_username) = &self.kafka.sasl_username {
            config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &self.kafka.sasl_password {
            config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &self.kafka.ssl_ca_location {
            config.set("ssl.ca.location", ssl_ca_location);
        }

        for (key, value) in &self.kafka.additional_properties {
            config.set(key, value);
        }

        config
    }

    /// Consumer settings for one topic binding. Offsets are committed by the
    /// dispatch loop once a message has been handled.
    pub fn consumer_config(&self, group_id: &str) -> rdkafka::ClientConfig {
        let mut config = self.base_kafka_config();
        config.set("group.id", group_id);
        config.set("auto.offset.reset", "earliest");
        config.set("enable.auto.commit", "false");
        config.set("enable.partition.eof", "false");
        config
    }

    pub fn producer_config(&self) -> rdkafka::ClientConfig {
        let mut config = self.base_kafka_config();
        config.set("message.timeout.ms", self.publish_timeout_ms.to_string());
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(ReservationError::InvalidArgument(
                "bootstrap.servers must not be empty".to_string(),
            ));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ReservationError::InvalidArgument(
                "consumer group must not be empty".to_string(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ReservationError::InvalidArgument(
                "poll timeout must be positive".to_string(),
            ));
        }
        if self.publish_workers == 0 || self.channel_capacity == 0 {
            return Err(ReservationError::InvalidArgument(
                "publish workers and channel capacity must be positive".to_string(),
            ));
        }
        if self.allocation_attempts == 0 {
            return Err(ReservationError::InvalidArgument(
                "allocation attempts must be at least 1".to_string(),
            ));
        }
        let budget = self.consumer_stop_budget();
        if self.shutdown_timeout() <= budget {
            return Err(ReservationError::InvalidArgument(format!(
                "shutdown timeout {:?} must exceed the consumer stop budget {:?}",
                self.shutdown_timeout(),
                budget
            )));
        }
        Ok(())
    }
}
