//! Send, publish, and request/response over the in-process transport.

use envelope::BusMessage;
use omnibus_e2e_tests::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use transport::{handler_fn, ReceiveEndpointConfig, TransportError};

#[tokio::test]
async fn test_point_to_point_send_round_trips_typed_payload() {
    init_tracing();
    let (bus, _host) = started_bus().await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let serializer = bus.serializer();
    bus.connect_receive_endpoint(ReceiveEndpointConfig::new(
        address("orders"),
        handler_fn(move |ctx| {
            let sink = sink.clone();
            let serializer = serializer.clone();
            async move {
                let order: OrderSubmitted = serializer
                    .decode(ctx.envelope.body())
                    .map_err(|e| TransportError::handler(e.to_string()))?;
                sink.lock().push(order);
                Ok(())
            }
        }),
    ))
    .await
    .unwrap();

    let endpoint = bus.send_endpoint(&address("orders")).await.unwrap();
    endpoint
        .send(&OrderSubmitted {
            order_id: "ORD-100".into(),
            amount: 1250,
        })
        .await
        .unwrap();

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].order_id, "ORD-100");
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_fans_out_to_every_subscriber() {
    init_tracing();
    let (bus, _host) = started_bus().await;

    let deliveries = Arc::new(AtomicUsize::new(0));
    for name in ["billing", "shipping", "analytics"] {
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
            .subscribe(OrderSubmitted::message_type()),
        )
        .await
        .unwrap();
    }

    bus.publish(&OrderSubmitted {
        order_id: "ORD-101".into(),
        amount: 10,
    })
    .await
    .unwrap();

    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_response_with_correlated_replies() {
    init_tracing();
    let (bus, _host) = started_bus().await;

    // Responder at the conventional request address for the query type.
    let responder = bus.clone();
    bus.connect_receive_endpoint(ReceiveEndpointConfig::new(
        address(&format!("requests/{}", OrderStatusQuery::message_type())),
        handler_fn(move |ctx| {
            let bus = responder.clone();
            async move {
                let query: OrderStatusQuery = bus
                    .serializer()
                    .decode(ctx.envelope.body())
                    .map_err(|e| TransportError::handler(e.to_string()))?;
                bus.respond(
                    &ctx,
                    &OrderStatus {
                        order_id: query.order_id,
                        state: "shipped".into(),
                    },
                )
                .await
                .map_err(|e| TransportError::handler(e.to_string()))
            }
        }),
    ))
    .await
    .unwrap();

    let client = bus
        .request_client::<OrderStatusQuery>(Duration::from_secs(1))
        .unwrap();

    // Concurrent requests share one response endpoint; each reply must land
    // on its own request.
    let mut handles = Vec::new();
    for i in 0..10 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let status: OrderStatus = client
                .get_response(&OrderStatusQuery {
                    order_id: format!("ORD-{i}"),
                })
                .await
                .unwrap();
            assert_eq!(status.order_id, format!("ORD-{i}"));
            assert_eq!(status.state, "shipped");
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_timeout_against_silent_destination() {
    init_tracing();
    let (bus, _host) = started_bus().await;

    bus.connect_receive_endpoint(ReceiveEndpointConfig::new(
        address(&format!("requests/{}", OrderStatusQuery::message_type())),
        handler_fn(|_ctx| async { Ok(()) }),
    ))
    .await
    .unwrap();

    let client = bus
        .request_client::<OrderStatusQuery>(Duration::from_millis(100))
        .unwrap();
    let started = Instant::now();
    let result: Result<OrderStatus, _> = client
        .get_response(&OrderStatusQuery {
            order_id: "ORD-102".into(),
        })
        .await;
    let elapsed = started.elapsed();

    assert!(result.unwrap_err().is_timeout());
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(200));
    bus.shutdown().await.unwrap();
}
