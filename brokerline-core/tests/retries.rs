mod common;

use brokerline_core::{
    handler_fn, AckPolicy, Backoff, Broker, BrokerSettings, DispatchSettings, DispatcherState,
    ErrorKind, HandlerError, RetryPolicy, Subscription,
};
use brokerline_transport::in_memory::{InMemoryTransport, SettlementKind};
use brokerline_transport::Capabilities;
use common::{eventually, Events, OutboundFaults};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn kinds(transport: &InMemoryTransport, destination: &str) -> Vec<SettlementKind> {
    transport
        .settlements_for(destination)
        .into_iter()
        .map(|settlement| settlement.kind)
        .collect()
}

fn fast_settings() -> BrokerSettings {
    BrokerSettings {
        dispatch: DispatchSettings {
            receive_timeout: Duration::from_millis(50),
            reconnect: Backoff::exponential(Duration::from_millis(5), Duration::from_millis(20)),
            ..DispatchSettings::default()
        },
        ..BrokerSettings::default()
    }
}

#[tokio::test]
async fn recoverable_failure_is_requeued_k_times_then_dead_lettered() {
    let transport = InMemoryTransport::new();
    let events = Events::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut broker = Broker::builder(transport.clone())
        .observer(events.observer())
        .build();
    let counter = Arc::clone(&calls);
    broker
        .subscribe(
            Subscription::builder("orders")
                .retry(RetryPolicy::limited(2))
                .dead_letter("orders.dlq")
                .handler(handler_fn(move |_n: u32, _context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(HandlerError::retry("inventory service busy")) }
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();
    broker.publisher("orders").publish(&1).await.unwrap();

    assert!(eventually(|| transport.settlements_for("orders").len() == 3).await);
    broker.stop().await.unwrap();

    assert_eq!(
        kinds(&transport, "orders"),
        vec![
            SettlementKind::Requeued,
            SettlementKind::Requeued,
            SettlementKind::Rejected
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(events.count(ErrorKind::HandlerRecoverable), 3);
    assert_eq!(transport.pending("orders.dlq").len(), 1);
    assert!(transport.pending("orders").is_empty());
}

#[tokio::test]
async fn retry_succeeds_after_transient_failures() {
    let transport = InMemoryTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut broker = Broker::new(transport.clone());
    let counter = Arc::clone(&calls);
    broker
        .subscribe(
            Subscription::builder("orders")
                .retry(RetryPolicy::limited(5))
                .handler(handler_fn(move |_n: u32, context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let delivery = context.envelope().delivery_count();
                    async move {
                        if delivery < 3 {
                            Err(HandlerError::retry("not yet"))
                        } else {
                            Ok(())
                        }
                    }
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();
    broker.publisher("orders").publish(&1).await.unwrap();

    assert!(eventually(|| transport.settlements_for("orders").len() == 3).await);
    broker.stop().await.unwrap();

    assert_eq!(
        kinds(&transport, "orders"),
        vec![
            SettlementKind::Requeued,
            SettlementKind::Requeued,
            SettlementKind::Acked
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transport_without_requeue_retries_in_place() {
    let transport = InMemoryTransport::with_capabilities(Capabilities::pub_sub());
    let events = Events::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut broker = Broker::builder(transport.clone())
        .observer(events.observer())
        .build();
    let counter = Arc::clone(&calls);
    broker
        .subscribe(
            Subscription::builder("events")
                .retry(
                    RetryPolicy::limited(3)
                        .with_backoff(Backoff::exponential(Duration::from_millis(1), Duration::from_millis(5))),
                )
                .handler(handler_fn(move |_n: u32, _context| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if attempt < 3 {
                            Err(HandlerError::retry("flaky downstream"))
                        } else {
                            Ok(())
                        }
                    }
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();
    broker.publisher("events").publish(&1).await.unwrap();

    assert!(eventually(|| !transport.settlements_for("events").is_empty()).await);
    broker.stop().await.unwrap();

    assert_eq!(kinds(&transport, "events"), vec![SettlementKind::Acked]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(events.count(ErrorKind::HandlerRecoverable), 2);
}

#[tokio::test]
async fn pub_sub_default_does_not_retry() {
    let transport = InMemoryTransport::with_capabilities(Capabilities::pub_sub());
    let calls = Arc::new(AtomicUsize::new(0));
    let mut broker = Broker::new(transport.clone());
    let counter = Arc::clone(&calls);
    broker
        .subscriber(
            "events",
            handler_fn(move |_n: u32, _context| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(HandlerError::retry("down")) }
            }),
        )
        .unwrap();
    broker.start().await.unwrap();
    broker.publisher("events").publish(&1).await.unwrap();

    assert!(eventually(|| !transport.settlements_for("events").is_empty()).await);
    broker.stop().await.unwrap();

    assert_eq!(kinds(&transport, "events"), vec![SettlementKind::Rejected]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn manual_ack_is_left_to_the_handler() {
    let transport = InMemoryTransport::new();
    let events = Events::default();
    let mut broker = Broker::builder(transport.clone())
        .observer(events.observer())
        .build();
    broker
        .subscribe(
            Subscription::builder("orders")
                .ack_policy(AckPolicy::Manual)
                .handler(handler_fn(|_n: u32, context| async move {
                    context.acker().ack().await?;
                    Ok::<_, HandlerError>(())
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();
    broker.publisher("orders").publish(&1).await.unwrap();

    assert!(eventually(|| !transport.settlements_for("orders").is_empty()).await);
    broker.stop().await.unwrap();

    assert_eq!(kinds(&transport, "orders"), vec![SettlementKind::Acked]);
    assert!(events.kinds().is_empty());
}

#[tokio::test]
async fn manual_handler_that_forgets_to_settle_is_requeued() {
    let transport = InMemoryTransport::new();
    let events = Events::default();
    let mut broker = Broker::builder(transport.clone())
        .observer(events.observer())
        .build();
    broker
        .subscribe(
            Subscription::builder("orders")
                .ack_policy(AckPolicy::Manual)
                .handler(handler_fn(|_n: u32, context| async move {
                    if context.envelope().delivery_count() > 1 {
                        context.acker().ack().await?;
                    }
                    Ok::<_, HandlerError>(())
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();
    broker.publisher("orders").publish(&1).await.unwrap();

    assert!(eventually(|| transport.settlements_for("orders").len() == 2).await);
    broker.stop().await.unwrap();

    assert_eq!(
        kinds(&transport, "orders"),
        vec![SettlementKind::Requeued, SettlementKind::Acked]
    );
    assert_eq!(events.kinds(), vec![ErrorKind::AckFault]);
}

#[tokio::test]
async fn settling_an_auto_acked_delivery_is_reported() {
    let transport = InMemoryTransport::new();
    let events = Events::default();
    let mut broker = Broker::builder(transport.clone())
        .observer(events.observer())
        .build();
    broker
        .subscriber(
            "orders",
            handler_fn(|_n: u32, context| async move {
                context.acker().ack().await?;
                Ok::<_, HandlerError>(())
            }),
        )
        .unwrap();
    broker.start().await.unwrap();
    broker.publisher("orders").publish(&1).await.unwrap();

    assert!(eventually(|| events.count(ErrorKind::AckFault) == 1).await);
    broker.stop().await.unwrap();

    assert_eq!(kinds(&transport, "orders"), vec![SettlementKind::Acked]);
    assert_eq!(events.kinds(), vec![ErrorKind::AckFault]);
}

#[tokio::test]
async fn receive_failures_back_off_and_recover() {
    let transport = InMemoryTransport::new();
    let events = Events::default();
    let mut broker = Broker::builder(transport.clone())
        .settings(fast_settings())
        .observer(events.observer())
        .build();
    broker
        .subscriber(
            "orders",
            handler_fn(|_n: u32, _context| async { Ok::<_, HandlerError>(()) }),
        )
        .unwrap();
    broker.start().await.unwrap();

    transport.fail_receives(4);
    broker.publisher("orders").publish(&1).await.unwrap();

    assert!(eventually(|| !transport.settlements_for("orders").is_empty()).await);
    broker.stop().await.unwrap();

    assert_eq!(kinds(&transport, "orders"), vec![SettlementKind::Acked]);
    assert!(events.count(ErrorKind::Transport) >= 1);
}

#[tokio::test]
async fn persistent_settle_failures_stop_only_that_subscription() {
    let transport = InMemoryTransport::new();
    let events = Events::default();
    let mut broker = Broker::builder(transport.clone())
        .settings(fast_settings())
        .observer(events.observer())
        .build();
    broker
        .subscribe(
            Subscription::builder("flaky")
                .dispatch(DispatchSettings {
                    max_settle_failures: 2,
                    ..fast_settings().dispatch
                })
                .handler(handler_fn(|_n: u32, _context| async { Ok::<_, HandlerError>(()) }))
                .build(),
        )
        .unwrap();
    broker
        .subscriber(
            "steady",
            handler_fn(|_n: u32, _context| async { Ok::<_, HandlerError>(()) }),
        )
        .unwrap();
    broker.start().await.unwrap();

    let mut flaky_state = broker.watch_subscription("flaky").unwrap();
    transport.fail_settlements(2);
    let flaky = broker.publisher("flaky");
    flaky.publish(&1).await.unwrap();
    flaky.publish(&2).await.unwrap();

    let failed = tokio::time::timeout(
        Duration::from_secs(5),
        flaky_state.wait_for(|state| *state == DispatcherState::Failed),
    )
    .await
    .map(|state| state.is_ok());
    assert!(matches!(failed, Ok(true)));
    assert_eq!(events.count(ErrorKind::Transport), 2);

    broker.publisher("steady").publish(&3).await.unwrap();
    assert!(eventually(|| !transport.settlements_for("steady").is_empty()).await);
    assert!(broker
        .subscription_state("steady")
        .is_some_and(DispatcherState::is_active));

    broker.stop().await.unwrap();
    assert_eq!(
        broker.subscription_state("flaky"),
        Some(DispatcherState::Failed)
    );
}

#[tokio::test]
async fn persistent_publish_failures_stop_the_subscription_without_dropping() {
    let backend = InMemoryTransport::new();
    let transport = OutboundFaults::new(backend.clone(), &["results", "orders.dlq"], &[]);
    let events = Events::default();
    let mut broker = Broker::builder(transport)
        .observer(events.observer())
        .build();
    broker
        .subscribe(
            Subscription::builder("orders")
                .retry(RetryPolicy::none())
                .respond_to("results")
                .dead_letter("orders.dlq")
                .dispatch(DispatchSettings {
                    max_publish_failures: 2,
                    ..fast_settings().dispatch
                })
                .handler(handler_fn(|n: u32, _context| async move {
                    Ok::<_, HandlerError>(n * 2)
                }))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();

    let mut state = broker.watch_subscription("orders").unwrap();
    let publisher = broker.publisher("orders");
    for n in 0..5u32 {
        publisher.publish(&n).await.unwrap();
    }

    let failed = tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == DispatcherState::Failed),
    )
    .await
    .map(|state| state.is_ok());
    assert!(matches!(failed, Ok(true)));
    broker.stop().await.unwrap();

    assert_eq!(kinds(&backend, "orders"), vec![SettlementKind::Requeued]);
    assert_eq!(backend.pending("orders").len(), 5);
    assert!(backend.pending("orders.dlq").is_empty());
    assert!(events.count(ErrorKind::Publish) >= 2);
}

#[tokio::test]
async fn retry_budget_is_shared_by_competing_consumers() {
    let transport = InMemoryTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut brokers = Vec::new();
    for _ in 0..2 {
        let counter = Arc::clone(&calls);
        let mut broker = Broker::new(transport.clone());
        broker
            .subscribe(
                Subscription::builder("orders")
                    .retry(RetryPolicy::limited(2))
                    .handler(handler_fn(move |_n: u32, _context| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(HandlerError::retry("warehouse offline")) }
                    }))
                    .build(),
            )
            .unwrap();
        broker.start().await.unwrap();
        brokers.push(broker);
    }

    brokers[0].publisher("orders").publish(&1).await.unwrap();
    assert!(eventually(|| transport.settlements_for("orders").len() == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    for broker in &mut brokers {
        broker.stop().await.unwrap();
    }

    assert_eq!(
        kinds(&transport, "orders"),
        vec![
            SettlementKind::Requeued,
            SettlementKind::Requeued,
            SettlementKind::Rejected
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
