use async_trait::async_trait;
use dashmap::DashMap;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use super::{BlockingProducer, ConsumerFactory, KafkaMessage, TopicConsumer};
use crate::{Result, ReservationError};

#[derive(Default)]
struct TopicLog {
    messages: Mutex<Vec<Vec<u8>>>,
    appended: Notify,
}

impl TopicLog {
    fn messages(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct BrokerState {
    topics: DashMap<String, Arc<TopicLog>>,
    // next offset to hand out, per (topic, group)
    positions: DashMap<(String, String), Arc<AtomicUsize>>,
    committed: DashMap<(String, String), i64>,
    rejected_topics: DashMap<String, ()>,
    pending_poll_errors: DashMap<String, usize>,
}

impl BrokerState {
    fn topic(&self, topic: &str) -> Arc<TopicLog> {
        Arc::clone(self.topics.entry(topic.to_string()).or_default().value())
    }
}

/// In-process broker with per-topic append-only logs and consumer-group
/// positions. Used by tests and by local runs without a Kafka cluster.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish to `topic` fail.
    pub fn reject_topic(&self, topic: &str) {
        self.state.rejected_topics.insert(topic.to_string(), ());
    }

    /// Make the next `count` polls on `topic` return a broker error.
    pub fn fail_next_polls(&self, topic: &str, count: usize) {
        *self.state.pending_poll_errors.entry(topic.to_string()).or_default() += count;
    }

    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state.topic(topic).messages().clone()
    }

    /// Highest committed offset for the group, if any message was committed.
    pub fn committed_offset(&self, topic: &str, group_id: &str) -> Option<i64> {
        self.state
            .committed
            .get(&(topic.to_string(), group_id.to_string()))
            .map(|offset| *offset)
    }

    fn take_poll_error(&self, topic: &str) -> bool {
        match self.state.pending_poll_errors.get_mut(topic) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl BlockingProducer for InMemoryBroker {
    fn send_blocking(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.state.rejected_topics.contains_key(topic) {
            return Err(ReservationError::publish(topic, "topic rejected by broker"));
        }

        let log = self.state.topic(topic);
        let offset = {
            let mut messages = log.messages();
            messages.push(payload.to_vec());
            messages.len() - 1
        };
        log.appended.notify_waiters();
        debug!("Appended message to {} at offset {}", topic, offset);
        Ok(())
    }

    fn flush_blocking(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

impl ConsumerFactory for InMemoryBroker {
    fn create_consumer(&self, topic: &str, group_id: &str, _offset_reset: &str) -> Result<Arc<dyn TopicConsumer>> {
        let position = Arc::clone(
            self.state
                .positions
                .entry((topic.to_string(), group_id.to_string()))
                .or_default()
                .value(),
        );

        Ok(Arc::new(InMemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            log: self.state.topic(topic),
            position,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    log: Arc<TopicLog>,
    position: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl InMemoryConsumer {
    fn next_message(&self) -> Option<KafkaMessage> {
        let messages = self.log.messages();
        let offset = self.position.load(Ordering::SeqCst);
        let payload = messages.get(offset)?.clone();
        self.position.store(offset + 1, Ordering::SeqCst);

        Some(KafkaMessage {
            topic: self.topic.clone(),
            partition: 0,
            offset: offset as i64,
            key: None,
            payload: Some(payload),
        })
    }
}

#[async_trait]
impl TopicConsumer for InMemoryConsumer {
    async fn recv_message(&self, timeout: Duration) -> Result<Option<KafkaMessage>> {
        if self.closed.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        if self.broker.take_poll_error(&self.topic) {
            return Err(ReservationError::Kafka(KafkaError::MessageConsumption(
                RDKafkaErrorCode::BrokerTransportFailure,
            )));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let appended = self.log.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(message) = self.next_message() {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn commit_message(&self, message: &KafkaMessage) -> Result<()> {
        self.broker
            .state
            .committed
            .entry((self.topic.clone(), self.group_id.clone()))
            .and_modify(|offset| *offset = (*offset).max(message.offset))
            .or_insert(message.offset);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
