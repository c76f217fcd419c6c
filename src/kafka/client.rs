use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::{BlockingProducer, ConsumerFactory, KafkaMessage, TopicConsumer, OFFSET_RESET_EARLIEST};
use crate::{Metrics, Result, ReservationError, ServiceConfig, TopicKind};

/// Callback invoked with the decoded JSON payload of every message on a
/// subscribed topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: TopicKind, payload: serde_json::Value) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub poll_timeout: Duration,
    pub poll_error_backoff: Duration,
    pub channel_capacity: usize,
    pub publish_workers: usize,
    pub publish_timeout: Duration,
    pub handler_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for DispatchSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout(),
            poll_error_backoff: Duration::from_millis(config.poll_error_backoff_ms),
            channel_capacity: config.channel_capacity.max(1),
            publish_workers: config.publish_workers.max(1),
            publish_timeout: config.publish_timeout(),
            handler_timeout: config.handler_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// A topic's registered handler together with the consumer feeding it.
pub struct TopicBinding {
    pub topic: TopicKind,
    pub group_id: String,
    pub offset_reset: &'static str,
    handler: Arc<dyn MessageHandler>,
    consumer: Arc<dyn TopicConsumer>,
    live: AtomicBool,
}

impl TopicBinding {
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.consumer.close();
            debug!("Closed consumer for {} (group {})", self.topic, self.group_id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Running,
    Exited,
}

struct ExitGuard<'a>(&'a watch::Sender<LoopState>);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(LoopState::Exited);
    }
}

/// Counts a spawned handler task while its future is alive. Dropped when the
/// task completes or is cancelled.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Cancels the handler task if the dispatch future is dropped mid-await,
/// e.g. when the supervisor aborts the loop.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Delivery {
    binding: Arc<TopicBinding>,
    message: KafkaMessage,
}

/// Publishes JSON events and drives the consume-dispatch-commit loop for the
/// registered topics.
///
/// Handlers are registered with [`subscribe`] before [`run`] starts; the loop
/// then delivers every message to its topic's handler one at a time, commits
/// the offset afterwards and keeps going whatever the handler returns.
///
/// [`subscribe`]: MessageBrokerClient::subscribe
/// [`run`]: MessageBrokerClient::run
pub struct MessageBrokerClient {
    producer: Arc<dyn BlockingProducer>,
    consumers: Arc<dyn ConsumerFactory>,
    bindings: DashMap<TopicKind, Arc<TopicBinding>>,
    publish_permits: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    state_tx: watch::Sender<LoopState>,
    in_flight: Arc<watch::Sender<usize>>,
    released: AtomicBool,
    settings: DispatchSettings,
    metrics: Metrics,
}

impl MessageBrokerClient {
    pub fn new(
        producer: Arc<dyn BlockingProducer>,
        consumers: Arc<dyn ConsumerFactory>,
        settings: DispatchSettings,
        metrics: Metrics,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(LoopState::Idle);

        Self {
            producer,
            consumers,
            bindings: DashMap::new(),
            publish_permits: Arc::new(Semaphore::new(settings.publish_workers)),
            stop_tx,
            state_tx,
            in_flight: Arc::new(watch::channel(0).0),
            released: AtomicBool::new(false),
            settings,
            metrics,
        }
    }

    /// Register `handler` for `topic`, replacing and closing any earlier
    /// binding for the same topic. Rejected once the dispatch loop has started.
    pub fn subscribe(&self, topic: TopicKind, group_id: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if *self.state_tx.borrow() != LoopState::Idle || *self.stop_tx.borrow() {
            return Err(ReservationError::RegistryClosed(format!(
                "cannot subscribe to {} once dispatch has started",
                topic
            )));
        }

        let consumer = self
            .consumers
            .create_consumer(topic.topic(), group_id, OFFSET_RESET_EARLIEST)?;

        let binding = Arc::new(TopicBinding {
            topic,
            group_id: group_id.to_string(),
            offset_reset: OFFSET_RESET_EARLIEST,
            handler,
            consumer,
            live: AtomicBool::new(true),
        });

        if let Some(previous) = self.bindings.insert(topic, binding) {
            previous.close();
            info!("Replaced handler for {}", topic);
        }
        info!("Subscribed to {} (group {})", topic, group_id);
        Ok(())
    }

    pub fn binding(&self, topic: TopicKind) -> Option<Arc<TopicBinding>> {
        self.bindings.get(&topic).map(|entry| Arc::clone(entry.value()))
    }

    pub fn topics(&self) -> Vec<TopicKind> {
        let mut topics: Vec<TopicKind> = self.bindings.iter().map(|entry| *entry.key()).collect();
        topics.sort_by_key(|topic| topic.topic());
        topics
    }

    pub fn is_running(&self) -> bool {
        *self.state_tx.borrow() == LoopState::Running
    }

    /// Handler tasks that have been spawned and not yet finished or cancelled.
    pub fn handlers_in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Serialize `payload` as JSON and publish it to `topic`, waiting for the
    /// broker acknowledgement on the bounded publish pool.
    pub async fn publish<T>(&self, topic: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(payload)?;

        let permit = Arc::clone(&self.publish_permits)
            .acquire_owned()
            .await
            .map_err(|_| ReservationError::publish(topic, "broker client is stopped"))?;

        let producer = Arc::clone(&self.producer);
        let topic_name = topic.to_string();
        let start = Instant::now();

        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            producer.send_blocking(&topic_name, &bytes)
        })
        .await
        .unwrap_or_else(|e| Err(ReservationError::publish(topic, e)));

        self.metrics.record_kafka_send(start.elapsed(), result.is_ok());

        match &result {
            Ok(()) => debug!("Published message to {}", topic),
            Err(e) => error!("Failed to publish to {}: {}", topic, e),
        }
        result
    }

    /// Poll every registered consumer and dispatch messages until a stop is
    /// requested. Handler failures are logged and never end the loop.
    ///
    /// Calling [`stop`] from inside a handler deadlocks; use [`request_stop`].
    ///
    /// [`stop`]: MessageBrokerClient::stop
    /// [`request_stop`]: MessageBrokerClient::request_stop
    pub async fn run(&self) -> Result<()> {
        let started = self.state_tx.send_if_modified(|state| {
            if *state == LoopState::Idle {
                *state = LoopState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ReservationError::RegistryClosed(
                "dispatch loop has already run".to_string(),
            ));
        }
        let _exit = ExitGuard(&self.state_tx);

        if *self.stop_tx.borrow() {
            info!("Stop requested before dispatch started");
            return Ok(());
        }

        let bindings: Vec<Arc<TopicBinding>> = self
            .bindings
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!("Dispatch loop started with {} consumer(s)", bindings.len());

        let (delivery_tx, mut delivery_rx) = mpsc::channel(self.settings.channel_capacity);
        let mut pollers = Vec::with_capacity(bindings.len());
        for binding in bindings {
            pollers.push(tokio::spawn(poll_consumer(
                binding,
                delivery_tx.clone(),
                self.stop_tx.subscribe(),
                self.settings.clone(),
                self.metrics.clone(),
            )));
        }
        drop(delivery_tx);

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => break,
                delivery = delivery_rx.recv() => match delivery {
                    Some(delivery) => self.dispatch(delivery).await,
                    None => {
                        let _ = self.stop_tx.subscribe().wait_for(|stop| *stop).await;
                        break;
                    }
                },
            }
        }

        drop(delivery_rx);
        for poller in pollers {
            if let Err(e) = poller.await {
                error!("Consumer task failed: {}", e);
            }
        }

        info!("Dispatch loop stopped");
        Ok(())
    }

    /// Ask the dispatch loop to exit after the message in flight.
    pub fn request_stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!("Stop requested for dispatch loop");
        }
    }

    /// Request a stop, wait for the dispatch loop to exit and for cancelled
    /// handler tasks to unwind, then close every consumer and flush the
    /// producer. Idempotent; also valid before `run`.
    pub async fn stop(&self) {
        self.request_stop();

        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx.wait_for(|state| *state != LoopState::Running).await;

        let mut in_flight_rx = self.in_flight.subscribe();
        let grace = self.settings.shutdown_grace;
        if tokio::time::timeout(grace, in_flight_rx.wait_for(|count| *count == 0))
            .await
            .is_err()
        {
            warn!(
                "{} handler task(s) still running {:?} after stop",
                self.handlers_in_flight(),
                grace
            );
        }

        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        for entry in self.bindings.iter() {
            entry.value().close();
        }

        let producer = Arc::clone(&self.producer);
        let flush_timeout = self.settings.publish_timeout;
        match tokio::task::spawn_blocking(move || producer.flush_blocking(flush_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Producer flush failed during stop: {}", e),
            Err(e) => warn!("Producer flush task failed: {}", e),
        }

        self.publish_permits.close();
        info!("Broker client stopped");
    }

    /// Upper bound on how long the dispatch loop may take to notice a stop.
    pub fn shutdown_bound(&self) -> Duration {
        let consumers = self.bindings.len().max(1) as u32;
        self.settings.poll_timeout * consumers
            + self.settings.handler_timeout.unwrap_or_default()
            + self.settings.shutdown_grace
    }

    async fn dispatch(&self, delivery: Delivery) {
        let Delivery { binding, message } = delivery;

        debug!(
            "Dispatching {} partition {} offset {} key {:?}",
            binding.topic, message.partition, message.offset, message.key
        );

        match message.deserialize_value::<serde_json::Value>() {
            Ok(payload) => self.invoke(&binding, payload).await,
            Err(e) => {
                self.metrics.decode_failures.inc();
                warn!(
                    "Dropping undecodable message on {} at offset {} (key {:?}): {}",
                    binding.topic, message.offset, message.key, e
                );
            }
        }

        if let Err(e) = binding.consumer.commit_message(&message) {
            self.metrics.commit_failures.inc();
            warn!(
                "Failed to commit offset {} on {}: {}",
                message.offset, binding.topic, e
            );
        }
    }

    async fn invoke(&self, binding: &TopicBinding, payload: serde_json::Value) {
        let topic = binding.topic;
        let handler = Arc::clone(&binding.handler);
        let start = Instant::now();

        let in_flight = InFlight::enter(&self.in_flight);
        let mut task = tokio::spawn(async move {
            let _in_flight = in_flight;
            handler.handle(topic, payload).await
        });
        let _cancel = AbortOnDrop(task.abort_handle());

        let joined = match self.settings.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    self.metrics.record_handler(start.elapsed(), false);
                    error!("Handler for {} timed out after {:?}", topic, limit);
                    return;
                }
            },
            None => task.await,
        };

        let success = match joined {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Handler for {} failed: {}", topic, e);
                false
            }
            Err(e) if e.is_panic() => {
                error!("Handler for {} panicked", topic);
                false
            }
            Err(e) => {
                error!("Handler task for {} was cancelled: {}", topic, e);
                false
            }
        };
        self.metrics.record_handler(start.elapsed(), success);
    }
}

async fn poll_consumer(
    binding: Arc<TopicBinding>,
    deliveries: mpsc::Sender<Delivery>,
    mut stop_rx: watch::Receiver<bool>,
    settings: DispatchSettings,
    metrics: Metrics,
) {
    debug!("Polling {} (group {})", binding.topic, binding.group_id);

    loop {
        let polled = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stop| *stop) => break,
            polled = binding.consumer.recv_message(settings.poll_timeout) => polled,
        };

        match polled {
            Ok(Some(message)) => {
                metrics.messages_received.inc();
                let delivery = Delivery {
                    binding: Arc::clone(&binding),
                    message,
                };
                if deliveries.send(delivery).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                metrics.poll_errors.inc();
                error!("Error polling {}: {}", binding.topic, e);
                tokio::time::sleep(settings.poll_error_backoff).await;
            }
        }
    }

    debug!("Stopped polling {}", binding.topic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::InMemoryBroker;
    use std::sync::atomic::AtomicUsize;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _topic: TopicKind, _payload: serde_json::Value) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            poll_timeout: Duration::from_millis(20),
            poll_error_backoff: Duration::from_millis(5),
            channel_capacity: 8,
            publish_workers: 2,
            publish_timeout: Duration::from_secs(1),
            handler_timeout: Some(Duration::from_millis(200)),
            shutdown_grace: Duration::from_millis(500),
        }
    }

    fn client(broker: &InMemoryBroker) -> Arc<MessageBrokerClient> {
        Arc::new(MessageBrokerClient::new(
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            settings(),
            Metrics::new().unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_stop_before_run_returns_promptly() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        client
            .subscribe(TopicKind::ReadyFail, "g", Arc::new(Counting(Arc::default())))
            .unwrap();

        client.stop().await;
        tokio::time::timeout(Duration::from_secs(1), client.run())
            .await
            .unwrap()
            .unwrap();
        assert!(!client.binding(TopicKind::ReadyFail).unwrap().is_live());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        client.stop().await;
        client.run().await.unwrap();
        assert!(matches!(client.run().await, Err(ReservationError::RegistryClosed(_))));
    }

    #[tokio::test]
    async fn test_poll_errors_do_not_end_the_loop() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        let seen = Arc::new(AtomicUsize::new(0));
        client
            .subscribe(TopicKind::ReadyFail, "g", Arc::new(Counting(seen.clone())))
            .unwrap();

        broker.fail_next_polls(TopicKind::ReadyFail.topic(), 3);
        broker
            .send_blocking(TopicKind::ReadyFail.topic(), br#"{"orderNumber":"x"}"#)
            .unwrap();

        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client.stop().await;
        runner.await.unwrap().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(client.metrics.poll_errors.get(), 3.0);
        assert_eq!(broker.committed_offset(TopicKind::ReadyFail.topic(), "g"), Some(0));
    }

    #[tokio::test]
    async fn test_publish_after_stop_fails() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        client.stop().await;

        let err = client.publish("any.topic", &serde_json::json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, ReservationError::Publish { .. }));
        assert!(broker.published("any.topic").is_empty());
    }

    #[test]
    fn test_shutdown_bound_covers_polls_and_handler() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        assert_eq!(
            client.shutdown_bound(),
            Duration::from_millis(20) + Duration::from_millis(200) + Duration::from_millis(500)
        );
    }

    struct Sleepy {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for Sleepy {
        async fn handle(&self, _topic: TopicKind, _payload: serde_json::Value) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_aborting_the_loop_cancels_the_running_handler() {
        let broker = InMemoryBroker::new();
        let client = Arc::new(MessageBrokerClient::new(
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            DispatchSettings {
                handler_timeout: None,
                ..settings()
            },
            Metrics::new().unwrap(),
        ));
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        client
            .subscribe(
                TopicKind::ReadyFail,
                "g",
                Arc::new(Sleepy {
                    started: started.clone(),
                    finished: finished.clone(),
                }),
            )
            .unwrap();
        broker.send_blocking(TopicKind::ReadyFail.topic(), b"{}").unwrap();

        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };
        let deadline = Instant::now() + Duration::from_secs(1);
        while started.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.handlers_in_flight(), 1);

        runner.abort();
        let _ = runner.await;
        client.stop().await;

        assert_eq!(client.handlers_in_flight(), 0);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
