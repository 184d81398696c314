//! Durable outbox delivery against a live bus, including dead-letter replay.

use envelope::{names, Envelope};
use omnibus_e2e_tests::*;
use outbox::{
    DeadLetterService, DeadLetterStore, InMemoryDeadLetterStore, InMemoryOutboxStore,
    NewDeadLetter, OutboxDispatcher, OutboxDispatcherConfig, OutboxRecord, OutboxStore,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transport::{handler_fn, ReceiveEndpointConfig, TransportError, TransportHost};

fn fast_config() -> OutboxDispatcherConfig {
    OutboxDispatcherConfig {
        poll_interval: Duration::from_millis(20),
        retry_delay: Duration::from_millis(10),
        batch_size: 16,
        channel_capacity: 64,
        max_concurrent_destinations: 4,
        shutdown_grace: Duration::from_millis(500),
    }
}

#[tokio::test]
async fn test_enqueued_message_survives_transport_outage() {
    init_tracing();
    let (bus, host) = started_bus().await;

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    bus.connect_receive_endpoint(ReceiveEndpointConfig::new(
        address("orders"),
        handler_fn(move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    ))
    .await
    .unwrap();

    let store = Arc::new(InMemoryOutboxStore::new());
    let dispatcher = OutboxDispatcher::new(
        store.clone(),
        bus.hosts(),
        bus_address(),
        fast_config(),
    );
    dispatcher.start();

    // Take the transport down, enqueue, and verify the message is retried
    // until the transport comes back.
    host.stop().await.unwrap();
    let envelope = bus
        .serializer()
        .encode(&OrderSubmitted {
            order_id: "ORD-200".into(),
            amount: 99,
        })
        .map(|body| {
            Envelope::builder("order.submitted")
                .body(body)
                .content_type("application/json")
                .build()
        })
        .unwrap();
    dispatcher
        .enqueue(OutboxRecord::send(
            &envelope,
            address("orders"),
            Some(bus_address()),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(store.get_pending(10).await.unwrap().len(), 1);

    host.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert!(store.get_pending(10).await.unwrap().is_empty());

    dispatcher.shutdown().await;
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_outbox_publish_fans_out_once_per_subscriber() {
    init_tracing();
    let (bus, _host) = started_bus().await;

    let deliveries = Arc::new(AtomicUsize::new(0));
    for name in ["warehouse", "billing"] {
        let counter = deliveries.clone();
        bus.connect_receive_endpoint(
            ReceiveEndpointConfig::new(
                address(name),
                handler_fn(move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .subscribe("order.submitted"),
        )
        .await
        .unwrap();
    }

    let store = Arc::new(InMemoryOutboxStore::new());
    let dispatcher = OutboxDispatcher::new(
        store.clone(),
        bus.hosts(),
        bus_address(),
        fast_config(),
    );
    dispatcher.start();

    let body = bus
        .serializer()
        .encode(&OrderSubmitted {
            order_id: "ORD-201".into(),
            amount: 5,
        })
        .unwrap();
    let envelope = Envelope::builder("order.submitted")
        .body(body)
        .content_type("application/json")
        .build();
    dispatcher
        .enqueue(OutboxRecord::publish(&envelope, Some(bus_address())))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
    assert!(store.get_pending(10).await.unwrap().is_empty());

    dispatcher.shutdown().await;
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_consumer_fault_dead_letters_then_replays() {
    init_tracing();
    let (bus, _host) = started_bus().await;

    // The consumer fails every attempt; its endpoint forwards to the DLQ
    // address, where a capture endpoint files the message in the store.
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let dlq_store = dead_letters.clone();
    bus.connect_receive_endpoint(ReceiveEndpointConfig::new(
        address("dead-letter"),
        handler_fn(move |ctx| {
            let store = dlq_store.clone();
            async move {
                let reason = ctx
                    .envelope
                    .headers()
                    .get_text(names::FAULT_REASON)
                    .unwrap_or("unknown")
                    .to_string();
                let description = ctx
                    .envelope
                    .headers()
                    .get_text(names::FAULT_MESSAGE)
                    .unwrap_or_default()
                    .to_string();
                store
                    .add(NewDeadLetter::from_envelope(
                        &ctx.envelope,
                        reason,
                        description,
                        None,
                    ))
                    .await
                    .map_err(|e| TransportError::handler(e.to_string()))?;
                Ok(())
            }
        }),
    ))
    .await
    .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(Mutex::new(Vec::new()));
    let attempt_counter = attempts.clone();
    let sink = processed.clone();
    bus.connect_receive_endpoint(
        ReceiveEndpointConfig::new(
            address("flaky"),
            handler_fn(move |ctx| {
                let attempts = attempt_counter.clone();
                let sink = sink.clone();
                async move {
                    // First pass (including its retry) fails; replays succeed.
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TransportError::handler("database unavailable"))
                    } else {
                        sink.lock().push(ctx.envelope.message_id());
                        Ok(())
                    }
                }
            }),
        )
        .with_retry(transport::RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        })
        .with_dead_letter_address(address("dead-letter")),
    )
    .await
    .unwrap();

    let endpoint = bus.send_endpoint(&address("flaky")).await.unwrap();
    endpoint
        .send(&OrderSubmitted {
            order_id: "ORD-202".into(),
            amount: 7,
        })
        .await
        .unwrap();

    let page = dead_letters.list(0, 10).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].reason, "consumer-fault");

    // Replay the dead letter back to its original destination. The snapshot
    // itself carries no destination, so the operator supplies one.
    let service = DeadLetterService::new(dead_letters.clone(), bus.hosts());
    service
        .replay(page[0].id, Some(address("flaky")))
        .await
        .unwrap();

    assert_eq!(processed.lock().len(), 1);
    let replayed = dead_letters.get(page[0].id).await.unwrap().unwrap();
    assert_eq!(replayed.replay_count, 1);
    assert!(replayed.last_error.is_none());

    bus.shutdown().await.unwrap();
}
