use chrono::Local;
use std::sync::Arc;
use tracing::info;

use crate::handlers::ReservationHandlers;
use crate::kafka::{
    BlockingProducer, ConsumerFactory, DispatchSettings, KafkaConsumerFactory, KafkaProducer,
    MessageBrokerClient,
};
use crate::retry::RetryConfig;
use crate::store::{open_store, ReservationStore};
use crate::supervisor::ConsumerSupervisor;
use crate::{
    Metrics, NewReservation, OrderNumber, OrderNumberAllocator, Reservation,
    ReservationStateMachine, Result, ServiceConfig, TransitionOutcome,
};

pub const MAX_PAGE_SIZE: usize = 100;

/// Shared handles of one running reservation core, built once at startup.
#[derive(Clone)]
pub struct ReservationContext {
    pub config: ServiceConfig,
    pub store: Arc<dyn ReservationStore>,
    pub broker: Arc<MessageBrokerClient>,
    pub metrics: Metrics,
    pub allocator: OrderNumberAllocator,
    pub state_machine: ReservationStateMachine,
}

impl ReservationContext {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn ReservationStore>,
        producer: Arc<dyn BlockingProducer>,
        consumers: Arc<dyn ConsumerFactory>,
        metrics: Metrics,
    ) -> Self {
        let broker = Arc::new(MessageBrokerClient::new(
            producer,
            consumers,
            DispatchSettings::from(&config),
            metrics.clone(),
        ));
        let allocator = OrderNumberAllocator::new(
            Arc::clone(&store),
            RetryConfig::order_allocation(config.allocation_attempts),
            metrics.clone(),
        );
        let state_machine = ReservationStateMachine::new(Arc::clone(&store), metrics.clone());

        Self {
            config,
            store,
            broker,
            metrics,
            allocator,
            state_machine,
        }
    }

    /// Context backed by Kafka and the configured store.
    pub fn connect(config: ServiceConfig, metrics: Metrics) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config)?;
        let producer = KafkaProducer::new(config.producer_config(), config.publish_timeout())?;
        let consumers = KafkaConsumerFactory::new(config.clone());
        info!(
            "Connected reservation context to {} ({:?} storage)",
            config.kafka.bootstrap_servers, config.storage
        );

        Ok(Self::new(config, store, Arc::new(producer), Arc::new(consumers), metrics))
    }

    pub fn register_handlers(&self) -> Result<()> {
        ReservationHandlers::new(self.state_machine.clone(), self.metrics.clone())
            .register(&self.broker, &self.config.consumer_group)
    }

    /// Subscribe the topic handlers and start the dispatch loop.
    pub async fn start_consumers(&self) -> Result<Arc<ConsumerSupervisor>> {
        self.register_handlers()?;
        let supervisor = Arc::new(ConsumerSupervisor::new(Arc::clone(&self.broker)));
        supervisor.start().await?;
        Ok(supervisor)
    }

    /// Create a Pending reservation stamped with the local wall clock.
    pub async fn create_reservation(&self, draft: NewReservation) -> Result<Reservation> {
        self.allocator
            .create_reservation(Local::now().naive_local(), draft)
            .await
    }

    pub async fn find_reservation(&self, order_number: &OrderNumber) -> Result<Option<Reservation>> {
        self.store.find_by_order_number(order_number).await
    }

    /// Page through a user's reservations; `limit` is clamped to 1..=100.
    pub async fn reservations_for_user(&self, user_id: &str, skip: usize, limit: usize) -> Result<Vec<Reservation>> {
        self.store
            .list_by_user(user_id, skip, limit.clamp(1, MAX_PAGE_SIZE))
            .await
    }

    pub async fn cancel_reservation(&self, order_number: &OrderNumber) -> Result<TransitionOutcome> {
        self.state_machine.cancel(order_number).await
    }
}
