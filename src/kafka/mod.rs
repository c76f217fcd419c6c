pub mod client;
pub mod consumer;
pub mod memory;
pub mod producer;

pub use client::*;
pub use consumer::*;
pub use memory::*;
pub use producer::*;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::{Result, ReservationError};

/// Offset policy for every reservation consumer group.
pub const OFFSET_RESET_EARLIEST: &str = "earliest";

#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

impl KafkaMessage {
    pub fn deserialize_value<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        match &self.payload {
            Some(payload) => {
                let value = serde_json::from_slice(payload)?;
                Ok(value)
            }
            None => Err(ReservationError::InvalidArgument("Empty message payload".to_string())),
        }
    }
}

/// One consumer handle bound to a single topic.
#[async_trait]
pub trait TopicConsumer: Send + Sync {
    /// Wait at most `timeout` for the next message.
    async fn recv_message(&self, timeout: Duration) -> Result<Option<KafkaMessage>>;

    fn commit_message(&self, message: &KafkaMessage) -> Result<()>;

    /// Release the broker-side subscription. Safe to call more than once.
    fn close(&self);
}

pub trait ConsumerFactory: Send + Sync {
    fn create_consumer(&self, topic: &str, group_id: &str, offset_reset: &str) -> Result<Arc<dyn TopicConsumer>>;
}

/// Producer whose calls block the current thread until the broker has
/// acknowledged or rejected the message.
pub trait BlockingProducer: Send + Sync {
    fn send_blocking(&self, topic: &str, payload: &[u8]) -> Result<()>;

    fn flush_blocking(&self, timeout: Duration) -> Result<()>;
}
