mod common;

use brokerline_core::{
    handler_fn, Broker, BrokerError, DispatcherState, HandlerError, PublishError, Requirement,
    Subscription,
};
use brokerline_transport::in_memory::{InMemoryTransport, SettlementKind};
use brokerline_transport::TransportError;
use common::{eventually, OutboundFaults};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn ok_handler() -> impl brokerline_core::Handler {
    handler_fn(|_n: u32, _context| async { Ok::<_, HandlerError>(()) })
}

#[tokio::test]
async fn failed_bind_starts_nothing() {
    let transport = InMemoryTransport::new();
    transport.reject_destination("forbidden");
    let mut broker = Broker::new(transport.clone());
    broker.subscriber("orders", ok_handler()).unwrap();
    broker.subscriber("forbidden", ok_handler()).unwrap();

    let err = broker.start().await.unwrap_err();

    assert!(matches!(
        err,
        BrokerError::Bind { destination, source: TransportError::Rejected(_) } if destination == "forbidden"
    ));
    assert!(!broker.is_running());
    assert!(!transport.is_connected());
    assert_eq!(broker.subscription_state("orders"), Some(DispatcherState::Idle));
    assert!(matches!(
        broker.publisher("orders").publish(&1).await,
        Err(PublishError::NotConnected(_))
    ));
}

struct Database;

#[tokio::test]
async fn missing_provider_is_reported_before_connecting() {
    let transport = InMemoryTransport::new();
    let mut broker = Broker::new(transport.clone());
    broker
        .subscribe(
            Subscription::builder("orders")
                .requires(Requirement::dependency::<Database>())
                .handler(ok_handler())
                .build(),
        )
        .unwrap();

    let err = broker.start().await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::MissingProvider { subscription, .. } if subscription == "orders"
    ));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn provided_dependency_satisfies_requirement() {
    let transport = InMemoryTransport::new();
    let mut broker = Broker::builder(transport.clone())
        .providers(|providers| {
            providers.value(Database);
        })
        .build();
    broker
        .subscribe(
            Subscription::builder("orders")
                .requires(Requirement::dependency::<Database>())
                .handler(ok_handler())
                .build(),
        )
        .unwrap();

    broker.start().await.unwrap();
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn declarations_are_validated() {
    let mut broker = Broker::new(InMemoryTransport::new());
    broker.subscriber("orders", ok_handler()).unwrap();

    assert!(matches!(
        broker.subscriber("orders", ok_handler()),
        Err(BrokerError::DuplicateSubscription(name)) if name == "orders"
    ));
    assert!(matches!(
        broker.subscribe(Subscription::builder("empty").build()),
        Err(BrokerError::NoHandler(_))
    ));

    broker.start().await.unwrap();
    assert!(matches!(
        broker.start().await,
        Err(BrokerError::AlreadyRunning)
    ));
    assert!(matches!(
        broker.subscriber("late", ok_handler()),
        Err(BrokerError::AlreadyRunning)
    ));
    broker.stop().await.unwrap();
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_handlers_within_grace_period() {
    let transport = InMemoryTransport::new();
    let mut broker = Broker::builder(transport.clone())
        .grace_period(Duration::from_secs(2))
        .build();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    broker
        .subscribe(
            Subscription::builder("orders")
                .workers(2)
                .handler(handler_fn(move |_n: u32, _context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, HandlerError>(())
                    }
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();

    let publisher = broker.publisher("orders");
    publisher.publish(&1).await.unwrap();
    publisher.publish(&2).await.unwrap();
    assert!(eventually(|| started.load(Ordering::SeqCst) == 2).await);

    broker.stop().await.unwrap();

    let settlements = transport.settlements_for("orders");
    assert_eq!(settlements.len(), 2);
    assert!(settlements
        .iter()
        .all(|settlement| settlement.kind == SettlementKind::Acked));
    assert_eq!(transport.in_flight(), 0);
    assert_eq!(
        broker.subscription_state("orders"),
        Some(DispatcherState::Stopped)
    );
}

#[tokio::test]
async fn stop_rejects_work_still_running_after_grace_period() {
    let transport = InMemoryTransport::new();
    let mut broker = Broker::builder(transport.clone())
        .grace_period(Duration::from_millis(100))
        .build();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    broker
        .subscribe(
            Subscription::builder("orders")
                .workers(3)
                .handler(handler_fn(move |_n: u32, _context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, HandlerError>(())
                    }
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();

    let publisher = broker.publisher("orders");
    for n in 0..3u32 {
        publisher.publish(&n).await.unwrap();
    }
    assert!(eventually(|| started.load(Ordering::SeqCst) == 3).await);

    let stopping = Instant::now();
    broker.stop().await.unwrap();
    assert!(stopping.elapsed() < Duration::from_secs(5));

    let settlements = transport.settlements_for("orders");
    assert_eq!(settlements.len(), 3);
    assert!(settlements
        .iter()
        .all(|settlement| settlement.kind == SettlementKind::Rejected));
    assert_eq!(transport.in_flight(), 0);
}

#[tokio::test]
async fn brokers_in_one_process_are_independent() {
    let first_transport = InMemoryTransport::new();
    let second_transport = InMemoryTransport::new();
    let mut first = Broker::new(first_transport.clone());
    let mut second = Broker::new(second_transport.clone());
    first.subscriber("orders", ok_handler()).unwrap();
    second.subscriber("orders", ok_handler()).unwrap();
    first.start().await.unwrap();
    second.start().await.unwrap();

    first.stop().await.unwrap();
    second.publisher("orders").publish(&1).await.unwrap();
    assert!(eventually(|| !second_transport.settlements_for("orders").is_empty()).await);
    assert!(second.is_running());
    assert!(first_transport.settlements_for("orders").is_empty());

    second.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_during_dead_letter_publish_still_rejects() {
    let backend = InMemoryTransport::new();
    let transport = OutboundFaults::new(backend.clone(), &[], &["orders.dlq"]);
    let mut broker = Broker::builder(transport)
        .grace_period(Duration::from_millis(100))
        .build();
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    broker
        .subscribe(
            Subscription::builder("orders")
                .dead_letter("orders.dlq")
                .handler(handler_fn(move |_n: u32, _context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(HandlerError::reject("unknown sku")) }
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();

    broker.publisher("orders").publish(&1).await.unwrap();
    assert!(eventually(|| handled.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.stop().await.unwrap();

    let settlements = backend.settlements_for("orders");
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].kind, SettlementKind::Rejected);
    assert_eq!(backend.in_flight(), 0);
    assert!(backend.pending("orders.dlq").is_empty());
}
