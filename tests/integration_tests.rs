use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use space_reservation::config_parser::{merge_properties_file, parse_properties_file};
use space_reservation::shutdown::{ShutdownComponent, ShutdownCoordinator};
use space_reservation::store::{open_store, InMemoryReservationStore, ReservationStore, RocksDbReservationStore};
use space_reservation::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{sleep, Duration, Instant};

fn fast_config() -> ServiceConfig {
    ServiceConfig {
        poll_timeout_ms: 20,
        poll_error_backoff_ms: 5,
        handler_timeout_ms: Some(1000),
        storage: StorageBackend::Memory,
        ..ServiceConfig::default()
    }
}

fn context_with(config: ServiceConfig, store: Arc<dyn ReservationStore>, broker: &InMemoryBroker) -> ReservationContext {
    ReservationContext::new(
        config,
        store,
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        Metrics::new().unwrap(),
    )
}

fn client(broker: &InMemoryBroker, handler_timeout: Option<Duration>) -> Arc<MessageBrokerClient> {
    let settings = DispatchSettings {
        poll_timeout: Duration::from_millis(20),
        poll_error_backoff: Duration::from_millis(5),
        handler_timeout,
        ..DispatchSettings::default()
    };
    Arc::new(MessageBrokerClient::new(
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        settings,
        Metrics::new().unwrap(),
    ))
}

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn draft(user: &str) -> NewReservation {
    NewReservation {
        space_id: "space-42".to_string(),
        space_name: "Workshop".to_string(),
        user_id: user.to_string(),
        user_name: "Park".to_string(),
        usage: UsageWindow::Slot {
            start_time: at(14, 0, 0),
            end_time: at(16, 0, 0),
        },
    }
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        sleep(Duration::from_millis(10)).await;
    }
}

struct Counting {
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageHandler for Counting {
    async fn handle(&self, _topic: TopicKind, _payload: serde_json::Value) -> Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl MessageHandler for AlwaysFails {
    async fn handle(&self, topic: TopicKind, _payload: serde_json::Value) -> Result<()> {
        Err(ReservationError::Handler(format!("{} handler is broken", topic)))
    }
}

struct Panics;

#[async_trait]
impl MessageHandler for Panics {
    async fn handle(&self, _topic: TopicKind, _payload: serde_json::Value) -> Result<()> {
        panic!("handler panic");
    }
}

struct Sleeps(Duration);

#[async_trait]
impl MessageHandler for Sleeps {
    async fn handle(&self, _topic: TopicKind, _payload: serde_json::Value) -> Result<()> {
        sleep(self.0).await;
        Ok(())
    }
}

struct Hangs;

#[async_trait]
impl MessageHandler for Hangs {
    async fn handle(&self, _topic: TopicKind, _payload: serde_json::Value) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct Recorder {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ShutdownComponent for Recorder {
    async fn shutdown(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

#[tokio::test]
async fn test_payment_flow_end_to_end() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryReservationStore::new());
    let ctx = context_with(fast_config(), store.clone(), &broker);

    let reservation = ctx
        .allocator
        .create_reservation(at(12, 30, 45), draft("u1"))
        .await
        .unwrap();
    let order = reservation.order_number.clone();
    assert_eq!(order.as_str(), "202401011230450000");
    assert_eq!(reservation.status, ReservationStatus::Pending);

    let supervisor = ctx.start_consumers().await.unwrap();

    ctx.broker
        .publish(
            TopicKind::ReadyApproval.topic(),
            &ReadyApproval {
                order_number: order.clone(),
                payment_id: 555,
            },
        )
        .await
        .unwrap();
    let group = ctx.config.consumer_group.clone();
    wait_until(|| broker.committed_offset(TopicKind::ReadyApproval.topic(), &group) == Some(0)).await;

    let stored = store.find_by_order_number(&order).await.unwrap().unwrap();
    assert_eq!(stored.payment_id, Some(555));
    assert_eq!(stored.status, ReservationStatus::Pending);

    let approval = OrderEvent {
        order_number: order.clone(),
    };
    ctx.broker
        .publish(TopicKind::PaymentApproval.topic(), &approval)
        .await
        .unwrap();
    wait_until(|| broker.committed_offset(TopicKind::PaymentApproval.topic(), &group) == Some(0)).await;
    let completed = store.find_by_order_number(&order).await.unwrap().unwrap();
    assert_eq!(completed.status, ReservationStatus::Completed);

    // redelivery and a late failure leave the completed reservation untouched
    ctx.broker
        .publish(TopicKind::PaymentApproval.topic(), &approval)
        .await
        .unwrap();
    ctx.broker
        .publish(TopicKind::ReadyFail.topic(), &approval)
        .await
        .unwrap();
    wait_until(|| {
        broker.committed_offset(TopicKind::PaymentApproval.topic(), &group) == Some(1)
            && broker.committed_offset(TopicKind::ReadyFail.topic(), &group) == Some(0)
    })
    .await;

    let replayed = store.find_by_order_number(&order).await.unwrap().unwrap();
    assert_eq!(replayed, completed);
    assert_eq!(ctx.metrics.transitions_applied.get(), 2.0);
    assert_eq!(ctx.metrics.transitions_unchanged.get(), 1.0);
    assert_eq!(ctx.metrics.transitions_rejected.get(), 1.0);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_unknown_order_is_acknowledged() {
    let broker = InMemoryBroker::new();
    let ctx = context_with(fast_config(), Arc::new(InMemoryReservationStore::new()), &broker);
    let supervisor = ctx.start_consumers().await.unwrap();

    ctx.broker
        .publish(
            TopicKind::ReadyFail.topic(),
            &serde_json::json!({"order_number": "202401011230459999"}),
        )
        .await
        .unwrap();

    let group = ctx.config.consumer_group.clone();
    wait_until(|| broker.committed_offset(TopicKind::ReadyFail.topic(), &group) == Some(0)).await;
    assert_eq!(ctx.metrics.reservations_not_found.get(), 1.0);
    assert_eq!(ctx.metrics.handler_failures.get(), 0.0);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_failing_topic_does_not_block_other_topics() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, Some(Duration::from_secs(1)));
    let seen = Arc::new(AtomicUsize::new(0));

    client.subscribe(TopicKind::ReadyFail, "g", Arc::new(AlwaysFails)).unwrap();
    client.subscribe(TopicKind::ReadyApproval, "g", Arc::new(Panics)).unwrap();
    client
        .subscribe(TopicKind::PaymentApproval, "g", Arc::new(Counting { seen: seen.clone() }))
        .unwrap();

    for i in 0..3 {
        let payload = serde_json::json!({"attempt": i});
        client.publish(TopicKind::ReadyFail.topic(), &payload).await.unwrap();
        client.publish(TopicKind::ReadyApproval.topic(), &payload).await.unwrap();
        client.publish(TopicKind::PaymentApproval.topic(), &payload).await.unwrap();
    }

    let supervisor = ConsumerSupervisor::new(client.clone());
    supervisor.start().await.unwrap();

    wait_until(|| {
        broker.committed_offset(TopicKind::ReadyFail.topic(), "g") == Some(2)
            && broker.committed_offset(TopicKind::ReadyApproval.topic(), "g") == Some(2)
            && broker.committed_offset(TopicKind::PaymentApproval.topic(), "g") == Some(2)
    })
    .await;
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert!(supervisor.is_running().await);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_no_handler_runs_after_stop() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, None);
    let seen = Arc::new(AtomicUsize::new(0));
    client
        .subscribe(TopicKind::PaymentApproval, "g", Arc::new(Counting { seen: seen.clone() }))
        .unwrap();

    let supervisor = ConsumerSupervisor::new(client.clone());
    supervisor.start().await.unwrap();

    broker
        .send_blocking(TopicKind::PaymentApproval.topic(), br#"{"order_number":"1"}"#)
        .unwrap();
    wait_until(|| seen.load(Ordering::SeqCst) == 1).await;

    supervisor.stop().await;
    assert!(!client.is_running());
    assert!(!supervisor.is_running().await);

    broker
        .send_blocking(TopicKind::PaymentApproval.topic(), br#"{"order_number":"2"}"#)
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // idempotent
    client.stop().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn test_components_after_a_hung_consumer_still_shut_down() {
    let mut config = ServiceConfig {
        handler_timeout_ms: None,
        publish_timeout_ms: 200,
        shutdown_grace_ms: 200,
        ..fast_config()
    };
    config.shutdown_timeout_ms = config.consumer_stop_budget().as_millis() as u64 + 500;
    config.validate().unwrap();

    let broker = InMemoryBroker::new();
    let ctx = context_with(config, Arc::new(InMemoryReservationStore::new()), &broker);
    ctx.broker
        .subscribe(TopicKind::PaymentApproval, "g", Arc::new(Hangs))
        .unwrap();
    broker
        .send_blocking(TopicKind::PaymentApproval.topic(), br#"{"order_number":"1"}"#)
        .unwrap();

    let supervisor = Arc::new(ConsumerSupervisor::new(ctx.broker.clone()));
    supervisor.start().await.unwrap();
    wait_until(|| ctx.broker.handlers_in_flight() == 1).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let coordinator = ShutdownCoordinator::new(ctx.config.shutdown_timeout());
    coordinator.register_component(supervisor.clone()).await;
    coordinator
        .register_component(Arc::new(Recorder { calls: calls.clone() }))
        .await;

    coordinator.shutdown().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.broker.handlers_in_flight(), 0);
    assert!(!supervisor.is_running().await);
}

#[tokio::test]
async fn test_subscribe_after_start_is_rejected() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, None);
    let supervisor = ConsumerSupervisor::new(client.clone());
    supervisor.start().await.unwrap();
    wait_until(|| client.is_running()).await;

    let err = client
        .subscribe(TopicKind::ReadyFail, "g", Arc::new(AlwaysFails))
        .unwrap_err();
    assert!(matches!(err, ReservationError::RegistryClosed(_)));

    supervisor.stop().await;
    assert!(client
        .subscribe(TopicKind::ReadyFail, "g", Arc::new(AlwaysFails))
        .is_err());
}

#[tokio::test]
async fn test_resubscribe_replaces_previous_handler() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, None);
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    client
        .subscribe(TopicKind::ReadyFail, "g", Arc::new(Counting { seen: first.clone() }))
        .unwrap();
    let replaced = client.binding(TopicKind::ReadyFail).unwrap();
    client
        .subscribe(TopicKind::ReadyFail, "g", Arc::new(Counting { seen: second.clone() }))
        .unwrap();

    assert!(!replaced.is_live());
    assert!(client.binding(TopicKind::ReadyFail).unwrap().is_live());
    assert_eq!(client.topics(), vec![TopicKind::ReadyFail]);

    let supervisor = ConsumerSupervisor::new(client.clone());
    supervisor.start().await.unwrap();
    client
        .publish(TopicKind::ReadyFail.topic(), &serde_json::json!({"n": 1}))
        .await
        .unwrap();
    wait_until(|| second.load(Ordering::SeqCst) == 1).await;
    assert_eq!(first.load(Ordering::SeqCst), 0);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_malformed_payload_is_dropped_and_committed() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, None);
    let seen = Arc::new(AtomicUsize::new(0));
    client
        .subscribe(TopicKind::ReadyFail, "g", Arc::new(Counting { seen: seen.clone() }))
        .unwrap();

    broker.send_blocking(TopicKind::ReadyFail.topic(), b"not json {").unwrap();
    broker
        .send_blocking(TopicKind::ReadyFail.topic(), br#"{"order_number":"x"}"#)
        .unwrap();

    let supervisor = ConsumerSupervisor::new(client.clone());
    supervisor.start().await.unwrap();
    wait_until(|| broker.committed_offset(TopicKind::ReadyFail.topic(), "g") == Some(1)).await;

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    supervisor.stop().await;
}

#[tokio::test]
async fn test_slow_handler_times_out_and_loop_continues() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, Some(Duration::from_millis(50)));
    let seen = Arc::new(AtomicUsize::new(0));
    client
        .subscribe(TopicKind::ReadyFail, "g", Arc::new(Sleeps(Duration::from_secs(30))))
        .unwrap();
    client
        .subscribe(TopicKind::PaymentApproval, "g", Arc::new(Counting { seen: seen.clone() }))
        .unwrap();

    broker.send_blocking(TopicKind::ReadyFail.topic(), b"{}").unwrap();
    broker.send_blocking(TopicKind::PaymentApproval.topic(), b"{}").unwrap();

    let supervisor = ConsumerSupervisor::new(client.clone());
    supervisor.start().await.unwrap();
    wait_until(|| {
        seen.load(Ordering::SeqCst) == 1
            && broker.committed_offset(TopicKind::ReadyFail.topic(), "g") == Some(0)
    })
    .await;

    supervisor.stop().await;
}

#[tokio::test]
async fn test_publish_rejection_is_surfaced() {
    let broker = InMemoryBroker::new();
    broker.reject_topic("reservation.outbound");
    let ctx = context_with(fast_config(), Arc::new(InMemoryReservationStore::new()), &broker);

    let err = ctx
        .broker
        .publish("reservation.outbound", &serde_json::json!({"order_number": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::Publish { ref topic, .. } if topic == "reservation.outbound"));
    assert_eq!(ctx.metrics.kafka_errors.get(), 1.0);

    ctx.broker.publish("reservation.other", &"ok").await.unwrap();
    assert_eq!(broker.published("reservation.other"), vec![br#""ok""#.to_vec()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creations_on_rocksdb_are_unique() {
    let temp_dir = tempdir().unwrap();
    let store: Arc<dyn ReservationStore> =
        Arc::new(RocksDbReservationStore::open(temp_dir.path().join("reservations")).unwrap());
    let config = ServiceConfig {
        allocation_attempts: 16,
        ..fast_config()
    };
    let ctx = context_with(config, store.clone(), &InMemoryBroker::new());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let allocator = ctx.allocator.clone();
        tasks.push(tokio::spawn(async move {
            allocator
                .create_reservation(at(9, 0, i), draft(&format!("user-{}", i)))
                .await
        }));
    }

    let mut sequences = Vec::new();
    for task in tasks {
        sequences.push(task.await.unwrap().unwrap().order_number.sequence());
    }
    sequences.sort_unstable();
    assert_eq!(sequences, (0..16).collect::<Vec<u16>>());

    let latest = store.latest_order_number("20240101").await.unwrap().unwrap();
    assert_eq!(latest.sequence(), 15);
}

#[tokio::test]
async fn test_config_files_and_store_selection() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("client.properties");
    std::fs::write(
        &config_path,
        format!(
            "bootstrap.servers=broker-1:9092,broker-2:9092\n\
             reservation.storage=rocksdb\n\
             reservation.state.dir={}\n",
            temp_dir.path().join("state").display()
        ),
    )
    .unwrap();

    let consumer_path = temp_dir.path().join("consumer.properties");
    std::fs::write(
        &consumer_path,
        "reservation.poll.timeout.ms=250\nfetch.min.bytes=1\n",
    )
    .unwrap();

    let config = parse_properties_file(&config_path, "reservation-service").unwrap();
    let config = merge_properties_file(config, &consumer_path).unwrap();

    assert_eq!(config.kafka.bootstrap_servers, "broker-1:9092,broker-2:9092");
    assert_eq!(config.storage, StorageBackend::RocksDb);
    assert_eq!(config.poll_timeout(), Duration::from_millis(250));
    assert_eq!(
        config.kafka.additional_properties.get("fetch.min.bytes"),
        Some(&"1".to_string())
    );

    let store = open_store(&config).unwrap();
    assert!(temp_dir.path().join("state").join("reservations").exists());
    assert!(store.latest_order_number("20240101").await.unwrap().is_none());
}
