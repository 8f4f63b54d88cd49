#![cfg(feature = "client")]

use redeliver::{Destination, InboundMessage, OutboundMessage, Transport};
use redeliver_nats::{NatsSink, NatsTransport};
use std::collections::HashMap;
use tower_service::Service;

fn nats_url() -> String {
    std::env::var("REDELIVER_TEST_NATS_URL").expect("set REDELIVER_TEST_NATS_URL")
}

// Requires NATS running and env REDELIVER_TEST_NATS_URL set, e.g. nats://127.0.0.1:4222
#[tokio::test]
#[ignore]
async fn publishes_events_to_nats() {
    let url = nats_url();
    let subject = "redelivery.events";

    let client = nats::asynk::connect(&url).await.expect("connect nats");
    let mut sink = NatsSink::new(client.clone(), subject);

    // subscribe before publishing to avoid drops
    let sub_client = nats::asynk::connect(&url).await.expect("connect nats sub");
    let sub = sub_client.subscribe(subject).await.expect("subscribe");

    sink.call(redeliver::RedeliveryEvent::Redelivered { delivery_id: 1, retry_count: 2 })
        .await
        .unwrap();

    let msg = sub.next().await.expect("message");
    let payload: serde_json::Value = serde_json::from_slice(&msg.data).unwrap();
    assert_eq!(payload["kind"], "redelivered");
    assert_eq!(payload["retry_count"], 2);
}

#[tokio::test]
#[ignore]
async fn publish_carries_headers() {
    let url = nats_url();
    let transport = NatsTransport::connect(&url).await.expect("connect nats");

    let sub_client = nats::asynk::connect(&url).await.expect("connect nats sub");
    let sub = sub_client.subscribe("orders").await.expect("subscribe");

    let mut headers = HashMap::new();
    headers.insert("x-redelivery-count".to_string(), "2".to_string());
    transport
        .publish(&Destination::from("orders"), OutboundMessage::new(b"hello".to_vec(), headers))
        .await
        .unwrap();

    let msg = sub.next().await.expect("message");
    assert_eq!(msg.data, b"hello");
    assert!(msg.headers.is_some());
}

#[tokio::test]
#[ignore]
async fn unknown_delivery_cannot_be_acknowledged() {
    let transport = NatsTransport::connect(&nats_url()).await.expect("connect nats");
    let stray = InboundMessage::new(42, b"x".to_vec(), HashMap::new());
    assert!(transport.acknowledge(&stray).await.is_err());
}
