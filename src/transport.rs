//! Messaging transport seam.
//!
//! The core never talks to a broker directly. It consumes three capabilities from an adapter:
//! a stream of failed messages (see [`DeadLetterConsumer::run`](crate::DeadLetterConsumer::run)),
//! `publish`, and `acknowledge`. Adapters own sessions, authentication and destination naming.
//!
//! [`InMemoryTransport`] records every call and lets tests script publish outcomes.

use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Message headers. Keys are unique; order carries no meaning.
pub type Headers = HashMap<String, String>;

/// Broker destination a message can be published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination(String);

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A message received from the dead-letter source.
///
/// `delivery_id` is the adapter's handle for acknowledging this delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    delivery_id: u64,
    payload: Vec<u8>,
    headers: Headers,
}

impl InboundMessage {
    pub fn new(delivery_id: u64, payload: impl Into<Vec<u8>>, headers: Headers) -> Self {
        Self { delivery_id, payload: payload.into(), headers }
    }

    /// Add or replace a header. Intended for adapters assembling a message.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn delivery_id(&self) -> u64 {
        self.delivery_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// A message the core asks the transport to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(payload: Vec<u8>, headers: Headers) -> Self {
        Self { payload, headers }
    }

    /// Copy of an inbound message with payload and headers untouched.
    pub fn copy_of(message: &InboundMessage) -> Self {
        Self::new(message.payload().to_vec(), message.headers().clone())
    }
}

/// Capabilities the core needs from a broker adapter.
///
/// `publish` resolves once the broker has confirmed the message; the core bounds the wait
/// itself, so implementations may block for as long as the broker takes.
/// `acknowledge` is called at most once per inbound message.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<(), TransportError>;

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        (**self).publish(destination, message).await
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError> {
        (**self).acknowledge(message).await
    }
}

/// How [`InMemoryTransport`] answers a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishBehavior {
    /// Confirm immediately.
    Ack,
    /// Confirm after the given delay.
    Delay(Duration),
    /// Report a transport failure.
    Fail(String),
    /// Never confirm.
    Stall,
    /// Panic inside the publish call.
    Panic,
}

type PublishScript = Arc<dyn Fn(&Destination, &OutboundMessage) -> PublishBehavior + Send + Sync>;

/// One recorded publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub destination: Destination,
    pub message: OutboundMessage,
    pub at: Instant,
}

#[derive(Default)]
struct Recorded {
    published: Vec<PublishRecord>,
    acknowledged: Vec<u64>,
}

/// In-process transport that records publishes and acknowledgments.
#[derive(Clone)]
pub struct InMemoryTransport {
    recorded: Arc<Mutex<Recorded>>,
    script: Arc<Mutex<Option<PublishScript>>>,
    fail_acks: Arc<AtomicBool>,
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recorded = lock(&self.recorded);
        f.debug_struct("InMemoryTransport")
            .field("published", &recorded.published.len())
            .field("acknowledged", &recorded.acknowledged.len())
            .field("script", &"<script>")
            .finish()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// A transport that confirms every publish and acknowledgment.
    pub fn new() -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            script: Arc::new(Mutex::new(None)),
            fail_acks: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Decide per call how publishes behave.
    pub fn script<F>(&self, script: F)
    where
        F: Fn(&Destination, &OutboundMessage) -> PublishBehavior + Send + Sync + 'static,
    {
        *lock(&self.script) = Some(Arc::new(script));
    }

    /// Fail every publish to `destination`.
    pub fn fail_publishes_to(&self, destination: impl Into<Destination>) {
        let failing = destination.into();
        self.script(move |dest, _| {
            if *dest == failing {
                PublishBehavior::Fail(format!("{} unavailable", failing))
            } else {
                PublishBehavior::Ack
            }
        });
    }

    /// Make acknowledgments fail from now on.
    pub fn fail_acknowledgments(&self) {
        self.fail_acks.store(true, Ordering::SeqCst);
    }

    /// Every publish call, in call order, whatever its outcome.
    pub fn published(&self) -> Vec<PublishRecord> {
        lock(&self.recorded).published.clone()
    }

    /// Messages published to one destination, in call order.
    pub fn published_to(&self, destination: &Destination) -> Vec<OutboundMessage> {
        lock(&self.recorded)
            .published
            .iter()
            .filter(|record| record.destination == *destination)
            .map(|record| record.message.clone())
            .collect()
    }

    /// Delivery ids passed to `acknowledge`, in call order.
    pub fn acknowledged(&self) -> Vec<u64> {
        lock(&self.recorded).acknowledged.clone()
    }

    fn behavior_for(&self, destination: &Destination, message: &OutboundMessage) -> PublishBehavior {
        let script = lock(&self.script).clone();
        script.map_or(PublishBehavior::Ack, |script| script(destination, message))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let behavior = self.behavior_for(destination, &message);
        lock(&self.recorded).published.push(PublishRecord {
            destination: destination.clone(),
            message,
            at: Instant::now(),
        });

        match behavior {
            PublishBehavior::Ack => Ok(()),
            PublishBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            PublishBehavior::Fail(reason) => {
                Err(TransportError::Publish { destination: destination.to_string(), reason })
            }
            PublishBehavior::Stall => futures::future::pending().await,
            PublishBehavior::Panic => panic!("scripted publish panic for {}", destination),
        }
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError> {
        lock(&self.recorded).acknowledged.push(message.delivery_id());
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(TransportError::Acknowledge {
                delivery_id: message.delivery_id(),
                reason: "scripted acknowledgment failure".into(),
            });
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64) -> InboundMessage {
        InboundMessage::new(id, b"HELLO WORLD".to_vec(), Headers::new()).with_header("k", "v")
    }

    #[test]
    fn inbound_message_accessors() {
        let msg = message(7);
        assert_eq!(msg.delivery_id(), 7);
        assert_eq!(msg.payload(), b"HELLO WORLD");
        assert_eq!(msg.headers().get("k").map(String::as_str), Some("v"));
        assert!(!msg.headers().contains_key("missing"));
    }

    #[test]
    fn outbound_copy_preserves_payload_and_headers() {
        let msg = message(1);
        let out = OutboundMessage::copy_of(&msg);
        assert_eq!(out.payload, msg.payload());
        assert_eq!(&out.headers, msg.headers());
    }

    #[test]
    fn destination_display_and_conversions() {
        let dest = Destination::from("orders");
        assert_eq!(dest.to_string(), "orders");
        assert_eq!(dest, Destination::new(String::from("orders")));
        assert_eq!(dest.as_str(), "orders");
    }

    #[tokio::test]
    async fn records_publishes_and_acks() {
        let transport = InMemoryTransport::new();
        let dest = Destination::from("orders");
        let msg = message(3);

        transport.publish(&dest, OutboundMessage::copy_of(&msg)).await.unwrap();
        transport.acknowledge(&msg).await.unwrap();

        assert_eq!(transport.published_to(&dest).len(), 1);
        assert_eq!(transport.acknowledged(), vec![3]);
    }

    #[tokio::test]
    async fn failing_destination_reports_error_but_records_attempt() {
        let transport = InMemoryTransport::new();
        transport.fail_publishes_to("errors");
        let msg = message(1);

        let err = transport
            .publish(&Destination::from("errors"), OutboundMessage::copy_of(&msg))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Publish { .. }));
        assert!(transport.publish(&"orders".into(), OutboundMessage::copy_of(&msg)).await.is_ok());
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn failing_acks_still_record_the_call() {
        let transport = InMemoryTransport::new();
        transport.fail_acknowledgments();
        let err = transport.acknowledge(&message(9)).await.unwrap_err();
        assert!(matches!(err, TransportError::Acknowledge { delivery_id: 9, .. }));
        assert_eq!(transport.acknowledged(), vec![9]);
    }

    #[tokio::test]
    async fn works_through_arc() {
        let transport = Arc::new(InMemoryTransport::new());
        let shared: Arc<InMemoryTransport> = Arc::clone(&transport);
        shared.acknowledge(&message(5)).await.unwrap();
        assert_eq!(transport.acknowledged(), vec![5]);
    }
}
