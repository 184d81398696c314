//! Shared fixtures for the end-to-end suite.

use envelope::BusMessage;
use omnibus::Bus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use transport::MemoryHost;
use url::Url;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn bus_address() -> Url {
    Url::parse("loopback://localhost/bus").unwrap()
}

pub fn address(path: &str) -> Url {
    Url::parse(&format!("loopback://localhost/bus/{path}")).unwrap()
}

/// A bus over a single in-process host, plus the host for direct access.
pub async fn started_bus() -> (Bus, Arc<MemoryHost>) {
    let host = Arc::new(MemoryHost::new(bus_address()));
    let bus = Bus::builder(bus_address())
        .host(host.clone())
        .request_address_resolver(|message_type| {
            Url::parse(&format!("loopback://localhost/bus/requests/{message_type}")).ok()
        })
        .build();
    bus.start().await.unwrap();
    (bus, host)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmitted {
    pub order_id: String,
    pub amount: i64,
}

impl BusMessage for OrderSubmitted {
    fn message_type() -> &'static str {
        "order.submitted"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCaptured {
    pub order_id: String,
}

impl BusMessage for PaymentCaptured {
    fn message_type() -> &'static str {
        "payment.captured"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusQuery {
    pub order_id: String,
}

impl BusMessage for OrderStatusQuery {
    fn message_type() -> &'static str {
        "order.status-query"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: String,
}

impl BusMessage for OrderStatus {
    fn message_type() -> &'static str {
        "order.status"
    }
}
