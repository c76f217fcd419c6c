use crate::{Result, ReservationError, ServiceConfig};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, TopicPartitionList};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{ConsumerFactory, KafkaMessage, TopicConsumer};

/// rdkafka consumer for one topic binding. Closing it drops the underlying
/// client, which leaves the group and releases its connections once any poll
/// still holding it returns.
pub struct KafkaConsumer {
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
}

impl KafkaConsumer {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let consumer: StreamConsumer = config.create()?;
        Ok(Self {
            consumer: Mutex::new(Some(Arc::new(consumer))),
        })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<()> {
        self.active()?.subscribe(topics)?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn current(&self) -> Option<Arc<StreamConsumer>> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active(&self) -> Result<Arc<StreamConsumer>> {
        self.current()
            .ok_or_else(|| ReservationError::InvalidArgument("kafka consumer is closed".to_string()))
    }
}

#[async_trait]
impl TopicConsumer for KafkaConsumer {
    async fn recv_message(&self, timeout_duration: Duration) -> Result<Option<KafkaMessage>> {
        let Some(consumer) = self.current() else {
            tokio::time::sleep(timeout_duration).await;
            return Ok(None);
        };

        match timeout(timeout_duration, consumer.recv()).await {
            Ok(Ok(message)) => {
                let key = message.key()
                    .map(|k| String::from_utf8_lossy(k).to_string());

                let payload = message.payload().map(|p| p.to_vec());

                Ok(Some(KafkaMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key,
                    payload,
                }))
            }
            Ok(Err(e)) => Err(ReservationError::Kafka(e)),
            Err(_) => Ok(None), // Timeout
        }
    }

    fn commit_message(&self, message: &KafkaMessage) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&message.topic, message.partition, rdkafka::Offset::Offset(message.offset + 1))?;
        self.active()?.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    fn close(&self) {
        let taken = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = taken {
            consumer.unsubscribe();
            debug!("Unsubscribed and dropped kafka consumer");
        }
    }
}

/// Creates one rdkafka consumer per topic binding.
pub struct KafkaConsumerFactory {
    config: ServiceConfig,
}

impl KafkaConsumerFactory {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn create_consumer(&self, topic: &str, group_id: &str, offset_reset: &str) -> Result<Arc<dyn TopicConsumer>> {
        let mut client_config = self.config.consumer_config(group_id);
        client_config.set("auto.offset.reset", offset_reset);

        let consumer = KafkaConsumer::new(client_config)?;
        consumer.subscribe(&[topic])?;
        info!("Kafka consumer subscribed to {} (group {})", topic, group_id);

        Ok(Arc::new(consumer))
    }
}
