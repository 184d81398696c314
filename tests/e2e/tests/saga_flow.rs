//! Message-driven sagas behind a live receive endpoint.

use envelope::BusMessage;
use omnibus_e2e_tests::*;
use parking_lot::Mutex;
use saga::{
    InMemorySagaRepository, SagaExecutor, SagaInstance, SagaOutcome, SagaRepository, SagaRouter,
    SagaStatus, SagaStep, SagaStyle, StepError, TypedSagaHandler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use transport::{handler_fn, ReceiveEndpointConfig, TransportError};
use uuid::Uuid;

/// Wire a router into a bus endpoint and drive one saga from start to
/// completion with two correlated messages.
#[tokio::test]
async fn test_saga_driven_by_bus_messages() {
    init_tracing();
    let (bus, _host) = started_bus().await;

    let repository = Arc::new(InMemorySagaRepository::new());
    let router = Arc::new(SagaRouter::new(repository.clone()));
    let saga_address = address("order-saga");

    router
        .register(
            &saga_address,
            OrderSubmitted::message_type(),
            Arc::new(TypedSagaHandler::new(
                bus.serializer(),
                true,
                |message: OrderSubmitted, mut instance: SagaInstance| async move {
                    instance.payload = serde_json::json!({
                        "order_id": message.order_id,
                        "amount": message.amount,
                    });
                    Ok((instance, SagaOutcome::Continue))
                },
            )),
        )
        .unwrap();
    router
        .register(
            &saga_address,
            PaymentCaptured::message_type(),
            Arc::new(TypedSagaHandler::new(
                bus.serializer(),
                false,
                |_: PaymentCaptured, instance: SagaInstance| async move {
                    Ok((instance, SagaOutcome::Complete))
                },
            )),
        )
        .unwrap();

    let dispatch_router = router.clone();
    bus.connect_receive_endpoint(ReceiveEndpointConfig::new(
        saga_address.clone(),
        handler_fn(move |ctx| {
            let router = dispatch_router.clone();
            async move {
                router
                    .dispatch(&ctx)
                    .await
                    .map_err(|e| TransportError::handler(e.to_string()))
            }
        }),
    ))
    .await
    .unwrap();

    let correlation = Uuid::new_v4();

    // Start message creates the instance.
    let body = bus
        .serializer()
        .encode(&OrderSubmitted {
            order_id: "ORD-300".into(),
            amount: 12,
        })
        .unwrap();
    let start = envelope::Envelope::builder(OrderSubmitted::message_type())
        .body(body)
        .content_type("application/json")
        .correlation_id(correlation)
        .build();
    let transport = bus
        .hosts()
        .resolve(&saga_address)
        .unwrap()
        .send_transport(&saga_address)
        .await
        .unwrap();
    transport.send(start).await.unwrap();

    let instance = repository.get(correlation).await.unwrap().unwrap();
    assert_eq!(instance.status, Some(SagaStatus::Running));
    assert_eq!(instance.version, 1);
    assert_eq!(instance.payload["order_id"], "ORD-300");

    // Completion message deletes it.
    let body = bus
        .serializer()
        .encode(&PaymentCaptured {
            order_id: "ORD-300".into(),
        })
        .unwrap();
    let done = envelope::Envelope::builder(PaymentCaptured::message_type())
        .body(body)
        .content_type("application/json")
        .correlation_id(correlation)
        .build();
    transport.send(done).await.unwrap();

    assert!(repository.get(correlation).await.unwrap().is_none());

    // A stale completion for the finished saga is silently ignored.
    let body = bus
        .serializer()
        .encode(&PaymentCaptured {
            order_id: "ORD-300".into(),
        })
        .unwrap();
    let stale = envelope::Envelope::builder(PaymentCaptured::message_type())
        .body(body)
        .content_type("application/json")
        .correlation_id(correlation)
        .build();
    transport.send(stale).await.unwrap();
    assert!(repository.is_empty());

    bus.shutdown().await.unwrap();
}

/// Executor steps that publish over the bus, with compensations undoing the
/// published effects when a later step fails.
#[tokio::test]
async fn test_executor_compensations_publish_over_the_bus() {
    init_tracing();
    let (bus, _host) = started_bus().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let serializer = bus.serializer();
    bus.connect_receive_endpoint(
        ReceiveEndpointConfig::new(
            address("audit"),
            handler_fn(move |ctx| {
                let sink = sink.clone();
                let serializer = serializer.clone();
                async move {
                    let event: OrderStatus = serializer
                        .decode(ctx.envelope.body())
                        .map_err(|e| TransportError::handler(e.to_string()))?;
                    sink.lock().push(event.state);
                    Ok(())
                }
            }),
        )
        .subscribe(OrderStatus::message_type()),
    )
    .await
    .unwrap();

    struct SagaCtx {
        bus: omnibus::Bus,
    }

    async fn publish_state(ctx: &SagaCtx, state: &str) -> Result<(), StepError> {
        ctx.bus
            .publish(&OrderStatus {
                order_id: "ORD-301".into(),
                state: state.into(),
            })
            .await
            .map_err(|e| StepError::new(e.to_string()))
    }

    let steps = vec![
        SagaStep::new(
            "reserve-stock",
            |ctx: Arc<SagaCtx>| async move { publish_state(&ctx, "stock-reserved").await },
            |ctx: Arc<SagaCtx>| async move { publish_state(&ctx, "stock-released").await },
        ),
        SagaStep::new(
            "capture-payment",
            |_ctx: Arc<SagaCtx>| async move {
                Err(StepError::new("card declined"))
            },
            |_ctx: Arc<SagaCtx>| async move { Ok(()) },
        ),
    ];

    let report = SagaExecutor::new()
        .execute(
            SagaStyle::Orchestration,
            Arc::new(SagaCtx { bus: bus.clone() }),
            &steps,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, SagaStatus::Compensated);
    assert_eq!(report.completed, vec!["reserve-stock"]);
    assert_eq!(
        *events.lock(),
        vec!["stock-reserved".to_string(), "stock-released".to_string()]
    );

    bus.shutdown().await.unwrap();
}
