use crate::{Result, ReservationError};
use rdkafka::error::KafkaResult;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::{ClientConfig, ClientContext};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::time::Duration;

use super::BlockingProducer;

/// Routes each delivery report back to the thread that produced the message.
pub struct DeliveryContext;

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<SyncSender<KafkaResult<()>>>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, delivery_opaque: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(e.clone()),
        };
        let _ = delivery_opaque.send(outcome);
    }
}

/// Blocking Kafka producer; run it on a blocking worker, never on the
/// async scheduler.
pub struct KafkaProducer {
    producer: BaseProducer<DeliveryContext>,
    send_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: ClientConfig, send_timeout: Duration) -> Result<Self> {
        let producer: BaseProducer<DeliveryContext> = config.create_with_context(DeliveryContext)?;
        Ok(Self {
            producer,
            send_timeout,
        })
    }
}

impl BlockingProducer for KafkaProducer {
    fn send_blocking(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let (report_tx, report_rx) = sync_channel(1);

        let record = BaseRecord::<(), [u8], _>::with_opaque_to(topic, Box::new(report_tx))
            .payload(payload);

        self.producer
            .send(record)
            .map_err(|(kafka_err, _)| ReservationError::publish(topic, kafka_err))?;

        self.producer
            .flush(self.send_timeout)
            .map_err(|e| ReservationError::publish(topic, e))?;

        match report_rx.recv_timeout(self.send_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ReservationError::publish(topic, e)),
            Err(_) => Err(ReservationError::publish(topic, "no delivery report from broker")),
        }
    }

    fn flush_blocking(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout)?;
        Ok(())
    }
}
