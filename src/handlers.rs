use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::kafka::{MessageBrokerClient, MessageHandler};
use crate::{
    Metrics, OrderEvent, OrderNumber, ReadyApproval, ReservationError, ReservationStateMachine,
    ReservationStatus, Result, TopicKind, TransitionOutcome,
};

/// Handler for the three payment gateway topics.
#[derive(Clone)]
pub struct ReservationHandlers {
    machine: ReservationStateMachine,
    metrics: Metrics,
}

impl ReservationHandlers {
    pub fn new(machine: ReservationStateMachine, metrics: Metrics) -> Self {
        Self { machine, metrics }
    }

    /// Subscribe one shared handler to every topic in `TopicKind::ALL`.
    pub fn register(self, client: &MessageBrokerClient, group_id: &str) -> Result<()> {
        let handler: Arc<dyn MessageHandler> = Arc::new(self);
        for topic in TopicKind::ALL {
            client.subscribe(topic, group_id, Arc::clone(&handler))?;
        }
        Ok(())
    }

    async fn on_event(&self, topic: TopicKind, payload: serde_json::Value) -> Result<(OrderNumber, TransitionOutcome)> {
        match topic {
            TopicKind::ReadyApproval => {
                let event: ReadyApproval = serde_json::from_value(payload)?;
                let outcome = self.machine.attach_payment(&event.order_number, event.payment_id).await;
                Ok((event.order_number, outcome?))
            }
            TopicKind::ReadyFail => {
                let event: OrderEvent = serde_json::from_value(payload)?;
                let outcome = self.machine.apply_status(&event.order_number, ReservationStatus::Failed).await;
                Ok((event.order_number, outcome?))
            }
            TopicKind::PaymentApproval => {
                let event: OrderEvent = serde_json::from_value(payload)?;
                let outcome = self.machine.apply_status(&event.order_number, ReservationStatus::Completed).await;
                Ok((event.order_number, outcome?))
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ReservationHandlers {
    async fn handle(&self, topic: TopicKind, payload: serde_json::Value) -> Result<()> {
        match self.on_event(topic, payload).await {
            Ok((order_number, outcome)) => {
                debug!("{} for {}: {:?}", topic, order_number, outcome);
                Ok(())
            }
            Err(ReservationError::NotFound(order_number)) => {
                self.metrics.reservations_not_found.inc();
                warn!("Dropping {} event: no reservation {}", topic, order_number);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
